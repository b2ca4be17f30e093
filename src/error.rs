use std::sync::Arc;
use thiserror::Error;

/// Error type crossing component boundaries. Handlers and resolvers return
/// `Result<Option<T>, IndexerError>` where `Ok(None)` is a soft miss (the
/// referent no longer exists upstream) and `Err` is a real failure.
#[derive(Debug, Error)]
pub enum IndexerError {
    #[error("appview request failed with status {status}: {message}")]
    Api {
        status: u16,
        message: String,
        ratelimit_remaining: Option<String>,
        ratelimit_reset: Option<i64>,
    },

    #[error("http transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("record failed validation: {0}")]
    InvalidRecord(String),

    #[error("retry budget exhausted for job {0}")]
    RetriesExhausted(String),

    #[error("request {0} was dropped before completion")]
    Canceled(String),

    #[error("{0}")]
    Shared(Arc<IndexerError>),
}

impl IndexerError {
    /// Transient failures the rate limiter may retry: 429, 5xx, and plain
    /// transport errors. Other 4xx responses are dropped immediately.
    pub fn is_retryable(&self) -> bool {
        match self {
            IndexerError::Api { status, .. } => *status == 429 || *status >= 500,
            IndexerError::Http(_) => true,
            IndexerError::Shared(inner) => inner.is_retryable(),
            _ => false,
        }
    }

    /// The appview reports deleted/deactivated actors as a request error
    /// rather than an empty result; callers treat this as a soft miss.
    pub fn is_profile_missing(&self) -> bool {
        match self {
            IndexerError::Api { message, .. } => message.contains("Profile not found"),
            IndexerError::Shared(inner) => inner.is_profile_missing(),
            _ => false,
        }
    }

    /// True when this wraps a unique violation on the named constraint.
    pub fn is_unique_violation(&self, constraint: &str) -> bool {
        match self {
            IndexerError::Db(sqlx::Error::Database(db)) => {
                db.constraint() == Some(constraint)
            }
            IndexerError::Shared(inner) => inner.is_unique_violation(constraint),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api(status: u16, message: &str) -> IndexerError {
        IndexerError::Api {
            status,
            message: message.to_string(),
            ratelimit_remaining: None,
            ratelimit_reset: None,
        }
    }

    #[test]
    fn retryable_statuses() {
        assert!(api(429, "rate limited").is_retryable());
        assert!(api(502, "bad gateway").is_retryable());
        assert!(!api(400, "invalid request").is_retryable());
        assert!(!IndexerError::InvalidRecord("bad".into()).is_retryable());
    }

    #[test]
    fn profile_missing_matches_through_shared() {
        let e = IndexerError::Shared(Arc::new(api(400, "Profile not found")));
        assert!(e.is_profile_missing());
        assert!(!api(400, "Invalid actor").is_profile_missing());
    }
}
