//! Error types for session operations.

use crate::subscriptions::SubscriptionPreprocessError;
use crate::transport::TransportError;
use crate::types::CorrelationId;
use thiserror::Error;

/// Main error type for session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Correlation id already in use: {0}")]
    DuplicateCorrelation(CorrelationId),

    #[error("Subscription preprocessing failed: {0}")]
    SubscriptionPreprocess(SubscriptionPreprocessError),

    #[error("Transport rejected operation (code {code}): {description}")]
    TransportRejection { code: i32, description: String },
}

impl From<TransportError> for SessionError {
    fn from(e: TransportError) -> Self {
        SessionError::TransportRejection {
            code: e.code,
            description: e.description,
        }
    }
}

impl From<SubscriptionPreprocessError> for SessionError {
    fn from(e: SubscriptionPreprocessError) -> Self {
        SessionError::SubscriptionPreprocess(e)
    }
}

/// Result type for session operations.
pub type Result<T> = std::result::Result<T, SessionError>;
