//! Command line grammar for the console.
//!
//! ```text
//! tab reviews            switch tab (slug or 1-7)
//! next | prev            cycle tabs
//! select review:12       open an entity in the detail pane
//! esc                    close the detail pane
//! back | forward         walk history
//! open <url>             follow a link
//! update review:12 {"due_date":"2024-03-15"}
//! create service {"name":"Ingest"}
//! delete service:42
//! refresh | retry | show | help | quit
//! ```

use serde_json::{Map, Value};
use url::Url;
use vantage_core::EntityRef;

use crate::nav::WorkspaceTab;

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Quit,
    Help,
    Show,
    NextTab,
    PrevTab,
    SwitchTab(WorkspaceTab),
    Select(EntityRef),
    Escape,
    Back,
    Forward,
    Open(Url),
    Refresh,
    Retry,
    Update {
        target: EntityRef,
        patch: Map<String, Value>,
    },
    Create {
        kind: String,
        body: Map<String, Value>,
    },
    Delete(EntityRef),
}

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("Empty command")]
    Empty,
    #[error("Unknown command: {0}")]
    Unknown(String),
    #[error("Missing argument: {0}")]
    MissingArgument(&'static str),
    #[error("Unknown tab: {0}")]
    InvalidTab(String),
    #[error("Invalid entity reference {0:?}, expected kind:id")]
    InvalidEntity(String),
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("Invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("Expected a JSON object")]
    NotAnObject,
}

pub const HELP: &str = "tab <name|1-7>, next, prev, select <kind:id>, esc, back, forward, \
open <url>, update <kind:id> <json>, create <kind> <json>, delete <kind:id>, \
refresh, retry, show, quit";

pub fn parse_command(line: &str) -> Result<Command, CommandError> {
    let line = line.trim();
    let (verb, rest) = match line.split_once(char::is_whitespace) {
        Some((verb, rest)) => (verb, rest.trim()),
        None => (line, ""),
    };
    if verb.is_empty() {
        return Err(CommandError::Empty);
    }

    match verb.to_ascii_lowercase().as_str() {
        "q" | "quit" | "exit" => Ok(Command::Quit),
        "?" | "help" => Ok(Command::Help),
        "show" | "ls" => Ok(Command::Show),
        "next" => Ok(Command::NextTab),
        "prev" => Ok(Command::PrevTab),
        "tab" => parse_tab(required(rest, "tab")?).map(Command::SwitchTab),
        "sel" | "select" => parse_entity(required(rest, "entity")?).map(Command::Select),
        "esc" | "escape" => Ok(Command::Escape),
        "back" => Ok(Command::Back),
        "forward" => Ok(Command::Forward),
        "open" => Ok(Command::Open(Url::parse(required(rest, "url")?)?)),
        "refresh" => Ok(Command::Refresh),
        "retry" => Ok(Command::Retry),
        "update" => {
            let (target, json) = split_argument(rest, "entity")?;
            Ok(Command::Update {
                target: parse_entity(target)?,
                patch: parse_object(required(json, "patch")?)?,
            })
        }
        "create" | "new" => {
            let (kind, json) = split_argument(rest, "kind")?;
            Ok(Command::Create {
                kind: kind.to_string(),
                body: parse_object(required(json, "body")?)?,
            })
        }
        "delete" | "rm" => parse_entity(required(rest, "entity")?).map(Command::Delete),
        other => Err(CommandError::Unknown(other.to_string())),
    }
}

fn required<'a>(rest: &'a str, name: &'static str) -> Result<&'a str, CommandError> {
    if rest.is_empty() {
        Err(CommandError::MissingArgument(name))
    } else {
        Ok(rest)
    }
}

fn split_argument<'a>(rest: &'a str, name: &'static str) -> Result<(&'a str, &'a str), CommandError> {
    let rest = required(rest, name)?;
    Ok(match rest.split_once(char::is_whitespace) {
        Some((first, tail)) => (first, tail.trim()),
        None => (rest, ""),
    })
}

fn parse_tab(raw: &str) -> Result<WorkspaceTab, CommandError> {
    if let Ok(number) = raw.parse::<usize>() {
        return number
            .checked_sub(1)
            .and_then(WorkspaceTab::from_index)
            .ok_or_else(|| CommandError::InvalidTab(raw.to_string()));
    }
    WorkspaceTab::from_slug(raw).ok_or_else(|| CommandError::InvalidTab(raw.to_string()))
}

fn parse_entity(raw: &str) -> Result<EntityRef, CommandError> {
    EntityRef::parse(raw).map_err(|_| CommandError::InvalidEntity(raw.to_string()))
}

fn parse_object(raw: &str) -> Result<Map<String, Value>, CommandError> {
    match serde_json::from_str::<Value>(raw)? {
        Value::Object(fields) => Ok(fields),
        _ => Err(CommandError::NotAnObject),
    }
}
