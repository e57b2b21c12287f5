//! User-facing notices, fanned out over a broadcast channel.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

const DEFAULT_BROADCAST_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    Info,
    Success,
    Warning,
    Error,
}

impl std::fmt::Display for NoticeLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Info => "info",
            Self::Success => "success",
            Self::Warning => "warning",
            Self::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// A short status message for the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    pub id: Uuid,
    pub level: NoticeLevel,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Broadcasts notices to any number of subscribers.
pub struct NoticeBus {
    tx: broadcast::Sender<Notice>,
}

impl Default for NoticeBus {
    fn default() -> Self {
        Self::new()
    }
}

impl NoticeBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(DEFAULT_BROADCAST_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notice> {
        self.tx.subscribe()
    }

    pub fn publish(&self, level: NoticeLevel, message: impl Into<String>) {
        let notice = Notice {
            id: Uuid::new_v4(),
            level,
            message: message.into(),
            at: Utc::now(),
        };
        debug!(level = %notice.level, message = %notice.message, "Notice");
        // No subscribers is fine.
        let _ = self.tx.send(notice);
    }

    pub fn info(&self, message: impl Into<String>) {
        self.publish(NoticeLevel::Info, message);
    }

    pub fn success(&self, message: impl Into<String>) {
        self.publish(NoticeLevel::Success, message);
    }

    pub fn warning(&self, message: impl Into<String>) {
        self.publish(NoticeLevel::Warning, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.publish(NoticeLevel::Error, message);
    }
}
