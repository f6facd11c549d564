use std::time::Duration;

use shared::{domain::ChannelId, error::ApiError};
use thiserror::Error;

/// Failure reported by a [`crate::MessageTransport`] call.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("network failure: {0}")]
    Network(String),
    #[error("server error {status}: {message}")]
    Server { status: u16, message: String },
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("request conflicts with server state: {0}")]
    Conflict(String),
    #[error("request rejected: {0}")]
    Rejected(ApiError),
    #[error("invalid response body: {0}")]
    Decode(String),
}

impl TransportError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::Network(_) | Self::Server { .. } | Self::RateLimited(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("local private key is locked")]
    KeyLocked,
    #[error("no peer encryption key is available for channel {0}")]
    MissingPeerKey(ChannelId),
    #[error("invalid encrypted envelope: {0}")]
    InvalidEnvelope(String),
    #[error("invalid key material: {0}")]
    InvalidKey(String),
    #[error("encryption failed: {0}")]
    Encrypt(String),
    #[error("decryption failed: {0}")]
    Decrypt(String),
}

/// Rejections raised before any network call is made. The caller keeps its draft.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("message must have content or at least one attachment")]
    EmptyMessage,
    #[error("message content is {actual} characters; the limit is {max}")]
    ContentTooLong { max: usize, actual: usize },
    #[error("encrypted messages cannot be edited to empty content")]
    EmptyEncryptedEdit,
    #[error("cannot encrypt for this channel: {0}")]
    Encryption(#[from] CryptoError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    TransientNetwork,
    Validation,
    Conflict,
    Decryption,
    Cancellation,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("request failed after {attempts} attempt(s): {source}")]
    Transient {
        attempts: u32,
        #[source]
        source: TransportError,
    },
    #[error("server rejected the change: {0}")]
    Conflict(#[source] TransportError),
    #[error("operation cancelled")]
    Cancelled,
}

impl EngineError {
    pub(crate) fn from_transport(error: TransportError, attempts: u32) -> Self {
        if error.is_transient() {
            Self::Transient {
                attempts,
                source: error,
            }
        } else {
            Self::Conflict(error)
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Validation(_) => ErrorCategory::Validation,
            Self::Transient { .. } => ErrorCategory::TransientNetwork,
            Self::Conflict(_) => ErrorCategory::Conflict,
            Self::Cancelled => ErrorCategory::Cancellation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::error::ErrorCode;

    #[test]
    fn classifies_transport_failures() {
        let timeout = EngineError::from_transport(TransportError::Timeout(Duration::from_secs(5)), 3);
        assert_eq!(timeout.category(), ErrorCategory::TransientNetwork);
        assert!(timeout.to_string().contains("3 attempt(s)"));

        let rejected = EngineError::from_transport(
            TransportError::Rejected(ApiError::new(ErrorCode::Forbidden, "missing permission")),
            1,
        );
        assert_eq!(rejected.category(), ErrorCategory::Conflict);
    }

    #[test]
    fn locked_key_is_a_validation_failure() {
        let err = EngineError::from(ValidationError::from(CryptoError::KeyLocked));
        assert_eq!(err.category(), ErrorCategory::Validation);
        assert!(err.to_string().contains("locked"));
    }
}
