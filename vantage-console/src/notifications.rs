//! Notification system for the console.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use vantage_core::CacheKey;

/// How many notifications are kept before the oldest is dropped.
pub const NOTIFICATION_CAPACITY: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationLevel {
    Info,
    Warning,
    Error,
    Success,
}

impl NotificationLevel {
    pub fn label(&self) -> &'static str {
        match self {
            NotificationLevel::Info => "info",
            NotificationLevel::Warning => "warning",
            NotificationLevel::Error => "error",
            NotificationLevel::Success => "ok",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationAction {
    /// Refetch the query that failed to load.
    Retry(CacheKey),
    Dismiss,
}

#[derive(Debug, Clone)]
pub struct Notification {
    pub level: NotificationLevel,
    pub message: String,
    pub action: Option<NotificationAction>,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(level: NotificationLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            action: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_action(mut self, action: NotificationAction) -> Self {
        self.action = Some(action);
        self
    }
}

/// Bounded, newest-last list of notifications.
#[derive(Debug, Clone, Default)]
pub struct Notifications {
    items: VecDeque<Notification>,
}

impl Notifications {
    pub fn push(&mut self, notification: Notification) {
        if self.items.len() == NOTIFICATION_CAPACITY {
            self.items.pop_front();
        }
        self.items.push_back(notification);
    }

    pub fn latest(&self) -> Option<&Notification> {
        self.items.back()
    }

    /// Oldest first.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Notification> + '_ {
        self.items.iter()
    }

    /// The most recent pending retry, if any.
    pub fn retry_target(&self) -> Option<&CacheKey> {
        self.items.iter().rev().find_map(|n| match &n.action {
            Some(NotificationAction::Retry(key)) => Some(key),
            _ => None,
        })
    }

    /// Drop every retry offer for `key`.
    pub fn resolve_retry(&mut self, key: &CacheKey) {
        self.items
            .retain(|n| n.action.as_ref() != Some(&NotificationAction::Retry(key.clone())));
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
