//! User-facing notifications.
//!
//! Components never render anything themselves; they hand `Notification`s
//! to a `NotificationSink` supplied by the presentation layer.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    #[default]
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "lowercase")]
pub enum NotificationPriority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "lowercase")]
pub enum NotificationCategory {
    #[default]
    System,
    Quiz,
    Enrollment,
    Course,
    Grade,
    User,
    Announcement,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "lowercase")]
pub enum NotificationAction {
    Retry,
    Reconnect,
    Reload,
    Dismiss,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct Notification {
    pub title: String,
    pub message: String,
    #[serde(rename = "type", default)]
    pub kind: NotificationKind,
    #[serde(default)]
    pub priority: NotificationPriority,
    #[serde(default)]
    pub category: NotificationCategory,
    /// Persistent notifications are not auto-dismissed.
    #[serde(default)]
    pub persistent: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<NotificationAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(
        kind: NotificationKind,
        title: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            title: title.into(),
            message: message.into(),
            kind,
            priority: NotificationPriority::Normal,
            category: NotificationCategory::System,
            persistent: false,
            actions: Vec::new(),
            metadata: None,
            created_at: Utc::now(),
        }
    }

    pub fn info(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(NotificationKind::Info, title, message)
    }

    pub fn success(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(NotificationKind::Success, title, message)
    }

    pub fn warning(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(NotificationKind::Warning, title, message)
    }

    pub fn error(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(NotificationKind::Error, title, message)
    }

    pub fn with_priority(mut self, priority: NotificationPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_category(mut self, category: NotificationCategory) -> Self {
        self.category = category;
        self
    }

    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }

    pub fn with_action(mut self, action: NotificationAction) -> Self {
        self.actions.push(action);
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Receiver of user-facing notifications (toasts, banners, inbox).
pub trait NotificationSink: Send + Sync {
    fn add_notification(&self, notification: Notification);
}

/// Collects notifications in memory.
#[derive(Default)]
pub struct MemorySink {
    items: Mutex<Vec<Notification>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Vec<Notification> {
        self.items.lock().clone()
    }

    pub fn drain(&self) -> Vec<Notification> {
        std::mem::take(&mut *self.items.lock())
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

impl NotificationSink for MemorySink {
    fn add_notification(&self, notification: Notification) {
        self.items.lock().push(notification);
    }
}

/// Writes notifications to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl NotificationSink for TracingSink {
    fn add_notification(&self, n: Notification) {
        match n.kind {
            NotificationKind::Error | NotificationKind::Warning => warn!(
                title = %n.title,
                category = ?n.category,
                persistent = n.persistent,
                "{}",
                n.message
            ),
            _ => info!(title = %n.title, category = ?n.category, "{}", n.message),
        }
    }
}
