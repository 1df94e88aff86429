use thiserror::Error;

pub type InsightResult<T> = Result<T, InsightError>;

#[derive(Error, Debug)]
pub enum InsightError {
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Concurrent modification: {0}")]
    Conflict(String),

    #[error("Event store read timed out after {0} ms")]
    StoreTimeout(u64),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Event store error: {0}")]
    Store(#[from] anyhow::Error),
}

impl InsightError {
    /// Failures a caller may retry for idempotent reads. Never retry
    /// event recording on these.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            InsightError::StoreTimeout(_) | InsightError::Store(_) | InsightError::Conflict(_)
        )
    }

    /// Failures caused by the request itself rather than the system.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            InsightError::InvalidState(_) | InsightError::InvalidInput(_) | InsightError::NotFound(_)
        )
    }
}

impl From<config::ConfigError> for InsightError {
    fn from(err: config::ConfigError) -> Self {
        InsightError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(InsightError::StoreTimeout(5000).is_retryable());
        assert!(InsightError::Store(anyhow::anyhow!("connection reset")).is_retryable());
        assert!(!InsightError::InvalidState("running".into()).is_retryable());

        assert!(InsightError::NotFound("variant".into()).is_client_error());
        assert!(InsightError::InvalidInput("traffic".into()).is_client_error());
        assert!(!InsightError::StoreTimeout(10).is_client_error());
    }

    #[test]
    fn test_error_display() {
        let err = InsightError::InvalidState("cannot pause a draft experiment".into());
        assert_eq!(
            err.to_string(),
            "Invalid state: cannot pause a draft experiment"
        );
    }
}
