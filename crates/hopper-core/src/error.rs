//! Error types for hopper.

use thiserror::Error;

use crate::JobId;

const TIMED_OUT: &str = "handler timed out";

#[derive(Debug, Error)]
pub enum Error {
    #[error("job {0} already exists")]
    DuplicateId(JobId),

    #[error("lost race on job {0}: state changed concurrently")]
    LostRace(JobId),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid cron expression '{expression}': {message}")]
    InvalidCron { expression: String, message: String },

    #[error("no handler registered for '{0}'")]
    UnknownHandler(String),

    #[error("{prefix} after {0:?}", prefix = TIMED_OUT)]
    HandlerTimeout(std::time::Duration),

    #[error("handler failed: {0}")]
    HandlerError(String),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("retries exhausted after {0} attempts")]
    RetriesExhausted(u32),
}

impl Error {
    /// Transient errors are retried by the polling loops and the producer.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::StoreUnavailable(_))
    }

    /// Whether a stored `last_error` was written for a `HandlerTimeout`.
    pub fn is_timeout_message(message: &str) -> bool {
        message.starts_with(TIMED_OUT)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_timeout_message_is_recognised() {
        let message = Error::HandlerTimeout(Duration::from_secs(5)).to_string();
        assert_eq!(message, "handler timed out after 5s");
        assert!(Error::is_timeout_message(&message));
        assert!(!Error::is_timeout_message(
            &Error::HandlerError("slow".into()).to_string()
        ));
    }

    #[test]
    fn test_only_store_errors_are_transient() {
        assert!(Error::StoreUnavailable("down".into()).is_transient());
        assert!(!Error::HandlerError("boom".into()).is_transient());
    }
}
