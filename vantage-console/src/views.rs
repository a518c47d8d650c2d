//! Plain-text rendering of the current location.

use serde_json::Value;
use std::fmt::Write;
use vantage_cache::{CacheEntry, QueryStatus};
use vantage_core::{CacheKey, EntityRef};

use crate::mutations::{entity_id, matches_id};
use crate::nav::WorkspaceTab;
use crate::notifications::Notifications;
use crate::queries::{entity_query, overview_key};
use crate::state::App;

/// Fields tried, in order, to label an entity in a list.
const LABEL_FIELDS: &[&str] = &["title", "name", "description"];

pub fn render_view(app: &App) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{}", render_tabs(app.active_tab()));
    let _ = writeln!(out, "@ {}", app.location());

    match app.project_id() {
        Some(project_id) if app.active_tab() == WorkspaceTab::Overview => {
            render_overview(&mut out, app, &overview_key(project_id));
        }
        Some(project_id) => {
            for kind in app.active_tab().allowed_kinds() {
                let Some(query) = entity_query(kind) else {
                    continue;
                };
                let key = query.collection_key(project_id);
                render_collection(&mut out, app, kind, &key);
            }
        }
        None => {
            let _ = writeln!(out, "(not a project location)");
        }
    }

    if let Some(selected) = app.selection() {
        render_detail(&mut out, app, selected);
    }

    render_notifications(&mut out, app.notifications());
    out
}

/// The three most recent notifications, oldest first.
fn render_notifications(out: &mut String, notifications: &Notifications) {
    let recent: Vec<_> = notifications.iter().rev().take(3).collect();
    if recent.is_empty() {
        return;
    }
    let _ = writeln!(out, "--");
    for notification in recent.into_iter().rev() {
        let retry = if notification.action.is_some() { " (retry)" } else { "" };
        let _ = writeln!(
            out,
            "[{}] {}{}",
            notification.level.label(),
            notification.message,
            retry
        );
    }
}

fn render_tabs(active: WorkspaceTab) -> String {
    WorkspaceTab::all()
        .iter()
        .map(|tab| {
            if *tab == active {
                format!("[{} {}]", tab.index() + 1, tab.title())
            } else {
                format!(" {} {} ", tab.index() + 1, tab.title())
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// `loading`, `stale`, `2 pending` and so on; empty when settled.
pub fn status_line(entry: &CacheEntry<Value>) -> String {
    let mut flags = Vec::new();
    match entry.status {
        QueryStatus::Loading => flags.push("loading".to_string()),
        QueryStatus::Error => {
            let message = entry.error.as_ref().map(|e| e.message.as_str()).unwrap_or("");
            flags.push(format!("error: {}", message));
        }
        QueryStatus::Idle | QueryStatus::Success => {}
    }
    if entry.is_stale {
        flags.push("stale".to_string());
    }
    if entry.pending_writes > 0 {
        flags.push(format!("{} pending", entry.pending_writes));
    }
    flags.join(", ")
}

fn render_heading(out: &mut String, title: &str, entry: Option<&CacheEntry<Value>>) {
    let status = entry.map(status_line).unwrap_or_else(|| "not loaded".to_string());
    if status.is_empty() {
        let _ = writeln!(out, "== {} ==", title);
    } else {
        let _ = writeln!(out, "== {} == ({})", title, status);
    }
}

fn render_overview(out: &mut String, app: &App, key: &CacheKey) {
    let entry = app.cache().get(key);
    render_heading(out, "Overview", entry.as_ref());
    if let Some(Value::Object(fields)) = entry.as_ref().and_then(|e| e.value.as_ref()) {
        for (name, value) in fields {
            let _ = writeln!(out, "  {}: {}", name, scalar(value));
        }
    }
}

fn render_collection(out: &mut String, app: &App, kind: &str, key: &CacheKey) {
    let entry = app.cache().get(key);
    render_heading(out, kind, entry.as_ref());
    let Some(Value::Array(items)) = entry.as_ref().and_then(|e| e.value.as_ref()) else {
        return;
    };
    if items.is_empty() {
        let _ = writeln!(out, "  (none)");
    }
    for item in items {
        let Some(id) = entity_id(item) else {
            continue;
        };
        let entity = EntityRef::new(kind, id);
        let marker = if app.selection() == Some(&entity) { ">" } else { " " };
        let _ = writeln!(out, "{} {}  {}", marker, entity, label(item));
    }
}

fn render_detail(out: &mut String, app: &App, selected: &EntityRef) {
    let Some(query) = entity_query(&selected.kind) else {
        return;
    };
    let entry = app.cache().get(&query.detail_key(&selected.id));
    render_heading(out, &selected.to_string(), entry.as_ref());

    // Fall back to the list row until the detail query has loaded.
    let from_detail = entry.and_then(|e| e.value).filter(Value::is_object);
    let entity = from_detail.or_else(|| {
        let project_id = app.project_id()?;
        let collection = app.cache().value(&query.collection_key(project_id))?;
        collection
            .as_array()?
            .iter()
            .find(|item| matches_id(item, &selected.id))
            .cloned()
    });
    match entity {
        Some(Value::Object(fields)) => {
            for (name, value) in &fields {
                let _ = writeln!(out, "  {}: {}", name, scalar(value));
            }
        }
        _ => {
            let _ = writeln!(out, "  (not found)");
        }
    }
}

fn label(entity: &Value) -> String {
    LABEL_FIELDS
        .iter()
        .find_map(|field| entity.get(*field).and_then(Value::as_str))
        .unwrap_or("")
        .to_string()
}

fn scalar(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
