//! Operator-facing notifications ("toasts").
//!
//! Every notification is logged and stored. Notifications raised with a
//! dedupe key are shown once, across restarts.

use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::db::DatabaseService;
use crate::error::ConsoleError;
use crate::service_utils::now_rfc3339;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Info,
    Success,
    Warning,
    Error,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Info => "info",
            Level::Success => "success",
            Level::Warning => "warning",
            Level::Error => "error",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "success" => Level::Success,
            "warning" => Level::Warning,
            "error" => Level::Error,
            _ => Level::Info,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub id: i64,
    pub dedupe_key: Option<String>,
    pub level: Level,
    pub message: String,
    pub created_at: String,
}

pub struct Notifier {
    db: DatabaseService,
}

impl Notifier {
    pub fn new(db: DatabaseService) -> Arc<Self> {
        Arc::new(Self { db })
    }

    #[cfg(test)]
    pub fn in_memory() -> Arc<Self> {
        let db = DatabaseService::in_memory().expect("in-memory sqlite");
        db.initialize_db().expect("notification schema");
        Self::new(db)
    }

    pub fn notify(&self, level: Level, message: impl Into<String>) {
        self.record(None, level, message.into());
    }

    /// Like [`Notifier::notify`], but suppressed when `dedupe_key` was
    /// already shown. Returns whether the notification was recorded.
    pub fn notify_once(&self, dedupe_key: &str, level: Level, message: impl Into<String>) -> bool {
        self.record(Some(dedupe_key), level, message.into())
    }

    /// Reports a failed operation: one error notification per failure.
    pub fn report_failure(&self, operation: &str, err: &ConsoleError) {
        let message = match err {
            ConsoleError::Backend(message) => message.clone(),
            other => format!("{} failed: {}", operation, other),
        };
        self.notify(Level::Error, message);
    }

    fn record(&self, dedupe_key: Option<&str>, level: Level, message: String) -> bool {
        match level {
            Level::Error => error!("[notification] {}", message),
            Level::Warning => warn!("[notification] {}", message),
            _ => info!("[notification] {}", message),
        }

        match self
            .db
            .insert_notification(dedupe_key, level, &message, &now_rfc3339())
        {
            Ok(recorded) => recorded,
            Err(e) => {
                error!("Failed to store notification: {:?}", e);
                false
            }
        }
    }

    pub fn recent(&self, limit: usize) -> Vec<Notification> {
        self.db.recent_notifications(limit).unwrap_or_else(|e| {
            error!("Failed to read notifications: {:?}", e);
            Vec::new()
        })
    }
}
