//! Exchange message wire format.
//!
//! ```text
//! [32 bytes: ephemeral X25519 public key] [64 bytes: Ed25519 signature]
//! ```
//!
//! The signature covers the public key bytes only. There is no length
//! prefix and no version field; framing is left to the transport.

use thiserror::Error;

use crate::agreement::KEY_SIZE;
use crate::identity::{IdentityError, LocalIdentity, RemoteIdentity, SIGNATURE_SIZE};

/// Encoded size of an [`ExchangeMessage`].
pub const MESSAGE_SIZE: usize = KEY_SIZE + SIGNATURE_SIZE;

/// Errors decoding an exchange message.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("message too short: {0} bytes, expected 96")]
    TooShort(usize),
}

/// Signed announcement of the sender's next ephemeral public key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeMessage {
    pub public_key: [u8; KEY_SIZE],
    pub signature: [u8; SIGNATURE_SIZE],
}

impl Default for ExchangeMessage {
    fn default() -> Self {
        Self {
            public_key: [0u8; KEY_SIZE],
            signature: [0u8; SIGNATURE_SIZE],
        }
    }
}

impl ExchangeMessage {
    /// Overwrite this message with `public_key` signed by `identity`.
    pub fn fill_signed(&mut self, public_key: &[u8; KEY_SIZE], identity: &dyn LocalIdentity) {
        self.public_key = *public_key;
        self.signature = identity.sign(&self.public_key);
    }

    /// Check the signature against the sender's long-term identity.
    pub fn verify(&self, identity: &dyn RemoteIdentity) -> Result<(), IdentityError> {
        identity.verify(&self.public_key, &self.signature)
    }

    pub fn encode(&self) -> [u8; MESSAGE_SIZE] {
        let mut buf = [0u8; MESSAGE_SIZE];
        buf[..KEY_SIZE].copy_from_slice(&self.public_key);
        buf[KEY_SIZE..].copy_from_slice(&self.signature);
        buf
    }

    /// Decode from the front of `bytes`. Anything past the first
    /// [`MESSAGE_SIZE`] bytes is ignored.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() < MESSAGE_SIZE {
            return Err(DecodeError::TooShort(bytes.len()));
        }

        let mut msg = Self::default();
        msg.public_key.copy_from_slice(&bytes[..KEY_SIZE]);
        msg.signature.copy_from_slice(&bytes[KEY_SIZE..MESSAGE_SIZE]);
        Ok(msg)
    }
}
