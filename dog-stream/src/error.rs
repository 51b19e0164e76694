use thiserror::Error;

/// Result type for messaging operations
pub type StreamResult<T> = Result<T, StreamError>;

/// Result type returned by listener handlers
pub type HandlerResult = Result<(), HandlerError>;

/// Infrastructure errors for the messaging layer
#[derive(Error, Debug, Clone)]
pub enum StreamError {
    /// Envelope could not be turned into wire bytes (or back)
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Broker unreachable or the operation was rejected
    #[error("Transport error: {0}")]
    Transport(String),

    /// A `before` interceptor aborted the publish
    #[error("Interceptor '{interceptor}' aborted publish: {reason}")]
    Interceptor { interceptor: String, reason: String },

    /// Broker version cannot support consumer groups
    #[error("Broker version {found} is below the minimum required major version {required}")]
    IncompatibleBroker { found: String, required: u32 },

    #[error("Lock operation failed: {0}")]
    LockFailed(String),

    #[error("Invalid cron expression '{expression}': {reason}")]
    InvalidCron { expression: String, reason: String },

    #[error("Invalid configuration for '{key}': {reason}")]
    InvalidConfig { key: String, reason: String },

    #[error("Shutdown failed: {0}")]
    ShutdownFailed(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl StreamError {
    /// Create a transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create an interceptor error
    pub fn interceptor(interceptor: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Interceptor {
            interceptor: interceptor.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_config(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Transport failures are worth retrying on the next tick; the rest are not
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::LockFailed(_))
    }
}

/// Handler outcome for a single delivery
///
/// Whatever the variant, a failed log delivery stays pending and is picked up
/// by the resend job once it has been idle long enough.
#[derive(Error, Debug, Clone)]
pub enum HandlerError {
    /// Processing may succeed on redelivery
    #[error("Retryable error: {0}")]
    Retryable(String),

    /// Processing will never succeed for this payload
    #[error("Permanent error: {0}")]
    Permanent(String),
}

impl HandlerError {
    /// Create a retryable error
    pub fn retryable(msg: impl Into<String>) -> Self {
        Self::Retryable(msg.into())
    }

    /// Create a permanent error
    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }

    /// Get the error message
    pub fn message(&self) -> &str {
        match self {
            Self::Retryable(msg) | Self::Permanent(msg) => msg,
        }
    }
}

impl From<StreamError> for HandlerError {
    fn from(err: StreamError) -> Self {
        if err.is_transient() {
            Self::Retryable(err.to_string())
        } else {
            Self::Permanent(err.to_string())
        }
    }
}

impl From<serde_json::Error> for StreamError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Permanent(format!("Failed to decode payload: {}", err))
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for StreamError {
    fn from(err: redis::RedisError) -> Self {
        Self::Transport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_map_to_retryable_handler_errors() {
        let err: HandlerError = StreamError::transport("connection reset").into();
        assert!(err.is_retryable());

        let err: HandlerError = StreamError::Serialization("bad json".into()).into();
        assert!(!err.is_retryable());
    }

    #[test]
    fn interceptor_error_names_the_hook() {
        let err = StreamError::interceptor("tenant", "missing tenant id");
        assert_eq!(
            err.to_string(),
            "Interceptor 'tenant' aborted publish: missing tenant id"
        );
    }
}
