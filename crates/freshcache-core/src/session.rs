use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Buffer time before expiry to trigger refresh (5 minutes)
const TOKEN_REFRESH_BUFFER_MINUTES: i64 = 5;

/// The authenticated user. Issued elsewhere; this crate only reads it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionData {
    pub token: String,
    pub user_id: i64,
    pub created_at: DateTime<Utc>,
    /// `None` for tokens without a known lifetime.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl SessionData {
    pub fn new(token: impl Into<String>, user_id: i64) -> Self {
        Self {
            token: token.into(),
            user_id,
            created_at: Utc::now(),
            expires_at: None,
        }
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at.map(|at| Utc::now() > at).unwrap_or(false)
    }

    /// Check if the session will expire soon and should be refreshed
    pub fn needs_refresh(&self) -> bool {
        self.expires_at
            .map(|at| Utc::now() > at - Duration::minutes(TOKEN_REFRESH_BUFFER_MINUTES))
            .unwrap_or(false)
    }

    /// Get minutes remaining until expiry (for display)
    pub fn minutes_until_expiry(&self) -> Option<i64> {
        self.expires_at
            .map(|at| (at - Utc::now()).num_minutes().max(0))
    }
}
