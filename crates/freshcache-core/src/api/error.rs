use thiserror::Error;

/// Errors crossing the network boundary.
///
/// Every component that talks to the server (writes, reads, polls, the push
/// channel) reports failures with this type so that retry decisions are made
/// in one place. `Clone` so the last error can be kept in observable state.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ApiError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Rate limited - please wait before retrying")]
    RateLimited,

    #[error("Unauthorized - token may be expired")]
    Unauthorized,

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Client error {status}: {message}")]
    Client { status: u16, message: String },

    #[error("Server error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Operation cancelled")]
    Cancelled,
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl ApiError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            let mut end = MAX_ERROR_BODY_LENGTH;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
        }
    }

    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let truncated = Self::truncate_body(body);
        match status.as_u16() {
            401 => ApiError::Unauthorized,
            403 => ApiError::AccessDenied(truncated),
            404 => ApiError::NotFound(truncated),
            408 => ApiError::Timeout,
            422 => ApiError::Validation(truncated),
            429 => ApiError::RateLimited,
            code @ 400..=499 => ApiError::Client {
                status: code,
                message: truncated,
            },
            code @ 500..=599 => ApiError::Server {
                status: code,
                message: truncated,
            },
            _ => ApiError::InvalidResponse(format!("Status {}: {}", status, truncated)),
        }
    }

    /// HTTP status this error was built from, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Timeout => Some(408),
            ApiError::RateLimited => Some(429),
            ApiError::Unauthorized => Some(401),
            ApiError::AccessDenied(_) => Some(403),
            ApiError::NotFound(_) => Some(404),
            ApiError::Client { status, .. } | ApiError::Server { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Whether an automatic retry may succeed.
    ///
    /// 4xx responses are final except 408 and 429. Validation failures and
    /// cancellation are never retried; everything else (connection failures,
    /// 5xx, malformed responses, channel drops) is.
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::Validation(_) | ApiError::Cancelled => false,
            other => match other.status() {
                Some(code @ 400..=499) => code == 408 || code == 429,
                _ => true,
            },
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ApiError::InvalidResponse(err.to_string())
        } else if let Some(status) = err.status() {
            ApiError::from_status(status, &err.to_string())
        } else {
            ApiError::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::InvalidResponse(err.to_string())
    }
}
