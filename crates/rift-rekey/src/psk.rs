//! Pre-shared key mixing and the derived secret type.
//!
//! With a PSK configured, every raw agreement output is XOR-folded with
//! `SHA3-256(psk || SALT)`. An observer of the Diffie-Hellman exchange
//! then still lacks the final key unless they also hold the PSK.

use sha3::{Digest, Sha3_256};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::agreement::KEY_SIZE;

/// Domain salt appended to the PSK before hashing.
///
/// Both peers must use the same value; changing it breaks interoperability.
pub const SALT: &[u8] = b"xaionaro-go/secureio.KeyExchanger";

/// Pre-shared key bytes, zeroized on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Psk(Vec<u8>);

impl Psk {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// `SHA3-256(psk || SALT)`.
    fn salted_hash(&self) -> Zeroizing<[u8; KEY_SIZE]> {
        let mut hasher = Sha3_256::new();
        hasher.update(&self.0);
        hasher.update(SALT);
        Zeroizing::new(hasher.finalize().into())
    }
}

impl fmt::Debug for Psk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Psk(<{} bytes>)", self.0.len())
    }
}

/// A derived 32-byte session secret.
///
/// Handed to the listener once per completed round; the exchanger keeps
/// no copy.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret([u8; KEY_SIZE]);

impl SharedSecret {
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedSecret(<redacted>)")
    }
}

/// Turn raw agreement output into the session secret.
///
/// Without a PSK (or with an empty one) the raw output is returned as is.
pub fn derive_secret(raw: &[u8; KEY_SIZE], psk: Option<&Psk>) -> SharedSecret {
    let mut key = *raw;
    if let Some(psk) = psk.filter(|p| !p.is_empty()) {
        let hash = psk.salted_hash();
        for (k, h) in key.iter_mut().zip(hash.iter()) {
            *k ^= h;
        }
    }
    SharedSecret(key)
}
