//! Vantage console entry point.

use std::io::BufRead;
use std::sync::Arc;
use tokio::sync::mpsc;
use url::Url;
use vantage_cache::{EventCause, KeyFilter};
use vantage_console::api_client::RestClient;
use vantage_console::commands::parse_command;
use vantage_console::config::ConsoleConfig;
use vantage_console::error::ConsoleError;
use vantage_console::events::ConsoleEvent;
use vantage_console::notifications::NotificationLevel;
use vantage_console::persistence;
use vantage_console::state::{App, Flow};
use vantage_console::telemetry;
use vantage_console::views::render_view;

#[tokio::main]
async fn main() -> Result<(), ConsoleError> {
    telemetry::init_logging()?;
    let config = ConsoleConfig::load()?;
    let api = Arc::new(RestClient::new(&config)?);

    let location = restore_location(&config)?;
    tracing::info!(location = %location, "console starting");
    let mut app = App::new(api, config.cache_config(), location);

    let (event_tx, mut event_rx) = mpsc::channel::<ConsoleEvent>(256);
    spawn_input_reader(event_tx.clone());
    app.forward_settled_writes(event_tx.clone());
    let cache_tx = event_tx.clone();
    app.cache().subscribe(KeyFilter::All, move |event| {
        let redraw = matches!(
            event.cause,
            EventCause::Fetched
                | EventCause::FetchFailed
                | EventCause::Speculative
                | EventCause::RolledBack
        );
        if redraw {
            let _ = cache_tx.try_send(ConsoleEvent::Cache(event.clone()));
        }
    });

    app.load_visible().await;
    println!("{}", render_view(&app));
    let mut rendered = app.cache().revision();

    while let Some(event) = event_rx.recv().await {
        match event {
            ConsoleEvent::Input(line) => {
                if line.trim().is_empty() {
                    continue;
                }
                match parse_command(&line) {
                    Ok(command) => {
                        if app.dispatch(command).await == Flow::Quit {
                            break;
                        }
                    }
                    Err(err) => app.notify(NotificationLevel::Error, err.to_string()),
                }
                println!("{}", render_view(&app));
                rendered = app.cache().revision();
            }
            ConsoleEvent::Cache(event) => {
                if event.revision.is_newer_than(&rendered) && app.is_visible(&event) {
                    println!("{}", render_view(&app));
                    rendered = app.cache().revision();
                }
            }
            ConsoleEvent::WriteSettled(settled) => {
                let _ = app.finish_write(settled).await;
                println!("{}", render_view(&app));
                rendered = app.cache().revision();
            }
            ConsoleEvent::InputClosed => break,
        }
    }

    if let Err(err) = persistence::save(&config.persistence_path, app.location()) {
        tracing::warn!(error = %err, "failed to persist console state");
    }
    Ok(())
}

/// The persisted location when it is still usable, else the configured
/// start URL.
fn restore_location(config: &ConsoleConfig) -> Result<Url, ConsoleError> {
    match persistence::load(&config.persistence_path) {
        Ok(Some(url)) => return Ok(url),
        Ok(None) => {}
        Err(err) => tracing::warn!(error = %err, "ignoring persisted location"),
    }
    Ok(config.start_location()?)
}

fn spawn_input_reader(sender: mpsc::Sender<ConsoleEvent>) {
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else {
                break;
            };
            if sender.blocking_send(ConsoleEvent::Input(line)).is_err() {
                return;
            }
        }
        let _ = sender.blocking_send(ConsoleEvent::InputClosed);
    });
}
