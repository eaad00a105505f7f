//! Error taxonomy for key rotation.
//!
//! Every failure the exchanger can observe is a tagged variant of
//! [`KeyExchangeError`]. Callers classify by tag: [`KeyExchangeError::is_fatal`]
//! tells apart conditions that tear the exchanger down from ones that are
//! absorbed locally.

use std::time::Duration;

use thiserror::Error;

use crate::agreement::AgreementError;
use crate::identity::IdentityError;
use crate::message::DecodeError;
use crate::transport::TransportError;

/// Result alias for key rotation operations.
pub type Result<T> = std::result::Result<T, KeyExchangeError>;

/// Errors produced by the key exchanger.
#[derive(Debug, Error)]
pub enum KeyExchangeError {
    /// Malformed inbound exchange message.
    #[error("unable to decode exchange message: {0}")]
    Decode(#[from] DecodeError),

    /// Exchange message signature did not verify.
    #[error("authentication failed: {0}")]
    Authentication(#[from] IdentityError),

    /// Key generation or Diffie-Hellman agreement failed.
    #[error("key agreement failed: {0}")]
    Agreement(#[from] AgreementError),

    /// The transport refused an outgoing exchange message.
    #[error("unable to send a public key: {0}")]
    Transmission(#[from] TransportError),

    /// No round completed within `interval + timeout`.
    #[error("key exchange timed out after {elapsed:?} without a completed round")]
    Timeout { elapsed: Duration },

    /// The exchanger was already closed.
    #[error("key exchanger is closed")]
    Closed,

    /// Invalid options or missing runtime.
    #[error("configuration error: {0}")]
    Config(String),
}

impl KeyExchangeError {
    /// Create a config error from any displayable type.
    pub fn config(msg: impl std::fmt::Display) -> Self {
        Self::Config(msg.to_string())
    }

    /// Whether this error terminates the exchanger.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Agreement(_) | Self::Transmission(_) | Self::Timeout { .. }
        )
    }

    /// Whether this error only signals that the exchanger was already closed.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(KeyExchangeError::Timeout {
            elapsed: Duration::from_secs(3)
        }
        .is_fatal());
        assert!(KeyExchangeError::Agreement(AgreementError::NonContributory).is_fatal());
        assert!(KeyExchangeError::Transmission(TransportError::Closed).is_fatal());

        assert!(!KeyExchangeError::Decode(DecodeError::TooShort(3)).is_fatal());
        assert!(!KeyExchangeError::Authentication(IdentityError::BadSignature).is_fatal());
        assert!(!KeyExchangeError::Closed.is_fatal());
        assert!(KeyExchangeError::Closed.is_closed());
    }

    #[test]
    fn test_display_mentions_cause() {
        let err = KeyExchangeError::from(DecodeError::TooShort(10));
        assert!(err.to_string().contains("10"));
    }
}
