//! Long-term Ed25519 identities used to authenticate exchange messages.
//!
//! The exchanger only needs two narrow capabilities: the local side signs
//! its ephemeral public key ([`LocalIdentity`]) and the remote side's
//! long-term key verifies what arrives ([`RemoteIdentity`]). Storage of
//! identity keys is left to the owning application.
//!
//! # Example
//!
//! ```
//! use rift_rekey::identity::{IdentityKeypair, LocalIdentity, RemoteIdentity};
//!
//! let keypair = IdentityKeypair::generate();
//! let public = keypair.public_identity();
//!
//! let signature = keypair.sign(b"ephemeral public key");
//! assert!(public.verify(b"ephemeral public key", &signature).is_ok());
//! ```

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use std::fmt;
use thiserror::Error;

/// Size of an Ed25519 public key.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Size of an Ed25519 signature.
pub const SIGNATURE_SIZE: usize = 64;

/// Identity errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("signature does not match")]
    BadSignature,

    #[error("invalid public key")]
    InvalidPublicKey,
}

/// Signing capability of the local peer.
pub trait LocalIdentity: Send + Sync {
    /// Sign `message` with the long-term private key.
    fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_SIZE];
}

/// Verification capability for the remote peer.
pub trait RemoteIdentity: Send + Sync {
    /// Verify that `signature` over `message` was made by this identity.
    fn verify(&self, message: &[u8], signature: &[u8; SIGNATURE_SIZE])
        -> Result<(), IdentityError>;

    /// Fingerprint used in log lines.
    fn fingerprint(&self) -> KeyFingerprint;
}

/// Verify `signature` over `message` against a raw Ed25519 public key.
pub fn verify_signature(
    signature: &[u8; SIGNATURE_SIZE],
    message: &[u8],
    public_key: &[u8; PUBLIC_KEY_SIZE],
) -> Result<(), IdentityError> {
    PublicIdentity::from_bytes(public_key)?.verify(message, signature)
}

/// Base64url rendering of a 32-byte public key (43 characters, no padding).
///
/// Names the peer in log lines.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct KeyFingerprint(String);

impl KeyFingerprint {
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Self(URL_SAFE_NO_PAD.encode(bytes))
    }
}

impl fmt::Display for KeyFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for KeyFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyFingerprint({})", self.0)
    }
}

/// Ed25519 identity keypair.
///
/// The signing key is zeroized on drop by `ed25519-dalek`.
pub struct IdentityKeypair {
    signing_key: SigningKey,
}

impl IdentityKeypair {
    /// Generate a new random keypair using the OS CSPRNG.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    pub fn fingerprint(&self) -> KeyFingerprint {
        KeyFingerprint::from_bytes(self.signing_key.verifying_key().as_bytes())
    }

    pub fn public_key_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        *self.signing_key.verifying_key().as_bytes()
    }

    /// The verification half, suitable for handing to the peer.
    pub fn public_identity(&self) -> PublicIdentity {
        PublicIdentity {
            verifying_key: self.signing_key.verifying_key(),
        }
    }
}

impl LocalIdentity for IdentityKeypair {
    fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_SIZE] {
        self.signing_key.sign(message).to_bytes()
    }
}

impl fmt::Debug for IdentityKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityKeypair")
            .field("fingerprint", &self.fingerprint())
            .finish_non_exhaustive()
    }
}

/// Public identity (verifying key only).
#[derive(Clone, Debug)]
pub struct PublicIdentity {
    verifying_key: VerifyingKey,
}

impl PublicIdentity {
    /// Create from raw public key bytes.
    pub fn from_bytes(bytes: &[u8; PUBLIC_KEY_SIZE]) -> Result<Self, IdentityError> {
        let verifying_key =
            VerifyingKey::from_bytes(bytes).map_err(|_| IdentityError::InvalidPublicKey)?;
        Ok(Self { verifying_key })
    }
}

impl RemoteIdentity for PublicIdentity {
    fn verify(
        &self,
        message: &[u8],
        signature: &[u8; SIGNATURE_SIZE],
    ) -> Result<(), IdentityError> {
        let sig = Signature::from_bytes(signature);
        self.verifying_key
            .verify(message, &sig)
            .map_err(|_| IdentityError::BadSignature)
    }

    fn fingerprint(&self) -> KeyFingerprint {
        KeyFingerprint::from_bytes(self.verifying_key.as_bytes())
    }
}
