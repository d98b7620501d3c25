//! # Queue Error Types
//!
//! Structured error handling for the queue subsystem using thiserror,
//! with helper constructors so call sites stay terse.

use thiserror::Error;

/// Errors surfaced by queue adapters and the task manager facade.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Backend connection error: {message}")]
    Connection { message: String },

    #[error("Queue operation failed: {queue_name}: {operation}: {message}")]
    QueueOperation {
        queue_name: String,
        operation: String,
        message: String,
    },

    #[error("Queue not found: {queue_name}")]
    QueueNotFound { queue_name: String },

    #[error("Message serialization error: {message}")]
    Serialization { message: String },

    #[error("Message deserialization error: {message}")]
    Deserialization { message: String },

    #[error("Configuration error: {component}: {message}")]
    Configuration { component: String, message: String },

    #[error("Invalid task message: {message}")]
    InvalidMessage { message: String },

    #[error("Database query error: {operation}: {message}")]
    DatabaseQuery { operation: String, message: String },

    #[error("Internal queue error: {message}")]
    Internal { message: String },
}

impl QueueError {
    /// Create a backend connection error
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Create a queue operation error
    pub fn queue_operation(
        queue_name: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::QueueOperation {
            queue_name: queue_name.into(),
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a queue not found error
    pub fn queue_not_found(queue_name: impl Into<String>) -> Self {
        Self::QueueNotFound {
            queue_name: queue_name.into(),
        }
    }

    /// Create a queue creation error
    pub fn queue_creation(queue_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::QueueOperation {
            queue_name: queue_name.into(),
            operation: "create".to_string(),
            message: message.into(),
        }
    }

    /// Create a publish/enqueue error
    pub fn publish(queue_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::QueueOperation {
            queue_name: queue_name.into(),
            operation: "publish".to_string(),
            message: message.into(),
        }
    }

    /// Create a consume error
    pub fn consume(queue_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::QueueOperation {
            queue_name: queue_name.into(),
            operation: "consume".to_string(),
            message: message.into(),
        }
    }

    /// Create a stats query error
    pub fn stats(queue_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::QueueOperation {
            queue_name: queue_name.into(),
            operation: "stats".to_string(),
            message: message.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Create a deserialization error
    pub fn deserialization(message: impl Into<String>) -> Self {
        Self::Deserialization {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Configuration {
            component: component.into(),
            message: message.into(),
        }
    }

    /// Create an invalid message error
    pub fn invalid_message(message: impl Into<String>) -> Self {
        Self::InvalidMessage {
            message: message.into(),
        }
    }

    /// Create a database query error
    pub fn database_query(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::DatabaseQuery {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// True when a provisioning error means the queue already exists.
    ///
    /// Both backends report duplicate provisioning differently (AMQP
    /// precondition failures, Postgres unique violations); callers treat
    /// either as success.
    pub fn is_already_exists(&self) -> bool {
        let text = self.to_string().to_lowercase();
        text.contains("already exists") || text.contains("duplicate") || text.contains("23505")
    }
}

impl From<sqlx::Error> for QueueError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => QueueError::database_query("query", "No rows found"),
            sqlx::Error::Database(db_err) => {
                QueueError::database_query("database", db_err.to_string())
            }
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
                QueueError::connection(err.to_string())
            }
            sqlx::Error::Configuration(config_err) => {
                QueueError::configuration("database", config_err.to_string())
            }
            _ => QueueError::connection(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_syntax() || err.is_data() {
            QueueError::deserialization(err.to_string())
        } else {
            QueueError::serialization(err.to_string())
        }
    }
}

impl From<lapin::Error> for QueueError {
    fn from(err: lapin::Error) -> Self {
        QueueError::connection(err.to_string())
    }
}

/// Result type alias for queue operations
pub type QueueResult<T> = Result<T, QueueError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let conn = QueueError::connection("broker unreachable");
        assert!(matches!(conn, QueueError::Connection { .. }));

        let op = QueueError::queue_operation("jobs", "publish", "channel closed");
        assert!(matches!(op, QueueError::QueueOperation { .. }));

        let cfg = QueueError::configuration("factory", "unknown backend");
        assert!(matches!(cfg, QueueError::Configuration { .. }));
    }

    #[test]
    fn test_error_display() {
        let err = QueueError::queue_creation("jobs", "permission denied");
        let display = format!("{err}");
        assert!(display.contains("jobs"));
        assert!(display.contains("create"));
        assert!(display.contains("permission denied"));
    }

    #[test]
    fn test_is_already_exists() {
        let dup = QueueError::queue_creation("jobs", "relation \"queue_jobs\" already exists");
        assert!(dup.is_already_exists());

        let unique = QueueError::database_query("insert", "error code 23505 unique violation");
        assert!(unique.is_already_exists());

        let other = QueueError::queue_creation("jobs", "permission denied");
        assert!(!other.is_already_exists());
    }

    #[test]
    fn test_sqlx_conversion() {
        let err: QueueError = sqlx::Error::PoolTimedOut.into();
        assert!(matches!(err, QueueError::Connection { .. }));

        let err: QueueError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, QueueError::DatabaseQuery { .. }));
    }

    #[test]
    fn test_serde_json_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("{oops").unwrap_err();
        let err: QueueError = json_err.into();
        assert!(matches!(err, QueueError::Deserialization { .. }));
    }
}
