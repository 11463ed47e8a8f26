//! Error types for the mailroom task engine.
//!

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum MailroomError {
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("Key-value store error: {0}")]
    KeyValueError(String),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Unknown task type: {0}")]
    UnknownTaskType(String),
    #[error("Configuration error: {0}")]
    ConfigurationError(String),
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Timeout error: {0}")]
    Timeout(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Lock error: {0}")]
    LockError(String),
    #[error("Flow engine error: {0}")]
    EngineError(String),
    #[error("Courier error: {0}")]
    CourierError(String),
    #[error("Search error: {0}")]
    SearchError(String),
    #[error("IVR error: {0}")]
    IvrError(String),
    #[error("HTTP error: {0}")]
    HttpError(String),
    #[error("Service unavailable: {0}")]
    Unavailable(String),
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for MailroomError {
    fn from(error: serde_json::Error) -> Self {
        MailroomError::SerializationError(format!("JSON serialization error: {error}"))
    }
}

impl From<sqlx::Error> for MailroomError {
    fn from(err: sqlx::Error) -> Self {
        MailroomError::DatabaseError(err.to_string())
    }
}

impl From<redis::RedisError> for MailroomError {
    fn from(err: redis::RedisError) -> Self {
        MailroomError::KeyValueError(err.to_string())
    }
}

impl From<config::ConfigError> for MailroomError {
    fn from(err: config::ConfigError) -> Self {
        MailroomError::ConfigurationError(err.to_string())
    }
}

impl From<reqwest::Error> for MailroomError {
    fn from(err: reqwest::Error) -> Self {
        MailroomError::HttpError(err.to_string())
    }
}

impl MailroomError {
    /// Whether the error came from shared infrastructure (stores, database) rather than
    /// from the body of a task.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            MailroomError::DatabaseError(_)
                | MailroomError::KeyValueError(_)
                | MailroomError::Unavailable(_)
        )
    }
}

pub type MailroomResult<T> = anyhow::Result<T, MailroomError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_errors_convert_to_serialization_errors() {
        let err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let converted: MailroomError = err.into();
        assert!(matches!(converted, MailroomError::SerializationError(_)));
        assert!(converted.to_string().starts_with("Serialization error: JSON"));
    }

    #[test]
    fn test_infrastructure_classification() {
        assert!(MailroomError::KeyValueError("down".into()).is_infrastructure());
        assert!(MailroomError::DatabaseError("gone".into()).is_infrastructure());
        assert!(!MailroomError::EngineError("bad flow".into()).is_infrastructure());
    }
}
