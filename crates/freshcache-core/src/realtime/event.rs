//! Push message wire format.
//!
//! Every frame is `{"type": ..., "payload": {...}}`.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::api::ApiError;
use crate::cache::KeyPart;
use crate::notifications::Notification;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataAction {
    Created,
    Updated,
    Deleted,
}

impl fmt::Display for DataAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DataAction::Created => "created",
            DataAction::Updated => "updated",
            DataAction::Deleted => "deleted",
        };
        f.write_str(s)
    }
}

/// A write made by another actor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataUpdate {
    pub entity: String,
    pub action: DataAction,
    pub id: KeyPart,
    /// When present, only these users should react to the update.
    #[serde(rename = "affectedUsers", default, skip_serializing_if = "Option::is_none")]
    pub affected_users: Option<Vec<i64>>,
}

impl DataUpdate {
    pub fn concerns(&self, user_id: Option<i64>) -> bool {
        match (&self.affected_users, user_id) {
            (None, _) => true,
            (Some(users), Some(user)) => users.contains(&user),
            (Some(_), None) => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct UserActivity {
    #[serde(rename = "userId", default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum InboundEvent {
    Notification(Notification),
    DataUpdate(DataUpdate),
    UserActivity(UserActivity),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Notification,
    DataUpdate,
    UserActivity,
}

impl InboundEvent {
    pub fn parse(text: &str) -> Result<Self, ApiError> {
        serde_json::from_str(text)
            .map_err(|e| ApiError::InvalidResponse(format!("push frame: {}", e)))
    }

    pub fn kind(&self) -> EventKind {
        match self {
            InboundEvent::Notification(_) => EventKind::Notification,
            InboundEvent::DataUpdate(_) => EventKind::DataUpdate,
            InboundEvent::UserActivity(_) => EventKind::UserActivity,
        }
    }
}

/// First frame sent after the connection opens.
pub fn auth_handshake(token: &str, user_id: i64) -> Value {
    json!({
        "type": "auth",
        "payload": { "token": token, "userId": user_id }
    })
}
