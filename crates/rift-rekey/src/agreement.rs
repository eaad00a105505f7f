//! X25519 ephemeral key agreement.
//!
//! Each rotation round stages one [`EphemeralKeyPair`]. Its public half is
//! signed and sent to the peer; its private half is combined with the
//! peer's public key to produce the raw 32-byte shared secret.

use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

/// Size of an X25519 private or public key.
pub const KEY_SIZE: usize = 32;

/// Key agreement errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AgreementError {
    #[error("unable to generate ephemeral keys: {0}")]
    KeyGeneration(String),

    /// The peer key is a low-order point; the output would not depend on
    /// our private key.
    #[error("peer public key is not contributory (low-order point)")]
    NonContributory,
}

/// Ephemeral X25519 key pair.
///
/// The private scalar is zeroized on drop by `x25519-dalek`.
pub struct EphemeralKeyPair {
    private_key: StaticSecret,
    public_key: PublicKey,
}

impl EphemeralKeyPair {
    /// Generate a fresh key pair from the OS CSPRNG.
    ///
    /// Unlike `StaticSecret::random_from_rng`, an RNG failure is reported
    /// instead of panicking.
    pub fn generate() -> Result<Self, AgreementError> {
        let mut seed = Zeroizing::new([0u8; KEY_SIZE]);
        OsRng
            .try_fill_bytes(&mut seed[..])
            .map_err(|e| AgreementError::KeyGeneration(e.to_string()))?;

        Ok(Self::from_private(*seed))
    }

    /// Build a key pair from a known private scalar.
    #[doc(hidden)]
    pub fn from_private(private: [u8; KEY_SIZE]) -> Self {
        let private_key = StaticSecret::from(private);
        let public_key = PublicKey::from(&private_key);
        Self {
            private_key,
            public_key,
        }
    }

    pub fn public_key(&self) -> &[u8; KEY_SIZE] {
        self.public_key.as_bytes()
    }

    /// Combine our private key with the peer's public key.
    pub fn combine(
        &self,
        peer_public: &[u8; KEY_SIZE],
    ) -> Result<Zeroizing<[u8; KEY_SIZE]>, AgreementError> {
        let peer = PublicKey::from(*peer_public);
        let shared = self.private_key.diffie_hellman(&peer);

        if !shared.was_contributory() {
            return Err(AgreementError::NonContributory);
        }

        Ok(Zeroizing::new(*shared.as_bytes()))
    }
}

impl std::fmt::Debug for EphemeralKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EphemeralKeyPair")
            .field("public_key", &self.public_key.as_bytes())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex32(s: &str) -> [u8; 32] {
        hex::decode(s).unwrap().try_into().unwrap()
    }

    #[test]
    fn test_both_sides_agree() {
        let alice = EphemeralKeyPair::generate().unwrap();
        let bob = EphemeralKeyPair::generate().unwrap();

        let alice_shared = alice.combine(bob.public_key()).unwrap();
        let bob_shared = bob.combine(alice.public_key()).unwrap();

        assert_eq!(*alice_shared, *bob_shared);
    }

    #[test]
    fn test_rfc7748_vector() {
        // RFC 7748 section 6.1
        let alice = EphemeralKeyPair::from_private(hex32(
            "77076d0a7318a57d3c16c17251b26645df4c2f87ebc0992ab177fba51db92c2a",
        ));
        let bob = EphemeralKeyPair::from_private(hex32(
            "5dab087e624a8a4b79e17f8b83800ee66f3bb1292618b6fd1c2f8b27ff88e0eb",
        ));

        assert_eq!(
            alice.public_key(),
            &hex32("8520f0098930a754748b7ddcb43ef75a0dbf3a0d26381af4eba4a98eaa9b4e6a")
        );

        let shared = alice.combine(bob.public_key()).unwrap();
        assert_eq!(
            *shared,
            hex32("4a5d9d5ba4ce2de1728e3bf480350f25e07e21c947d19e3376f09b3c1e161742")
        );
    }

    #[test]
    fn test_low_order_point_rejected() {
        let alice = EphemeralKeyPair::generate().unwrap();

        assert_eq!(
            alice.combine(&[0u8; 32]).err(),
            Some(AgreementError::NonContributory)
        );

        let mut one = [0u8; 32];
        one[0] = 1;
        assert_eq!(
            alice.combine(&one).err(),
            Some(AgreementError::NonContributory)
        );
    }

    #[test]
    fn test_generated_keys_differ() {
        let a = EphemeralKeyPair::generate().unwrap();
        let b = EphemeralKeyPair::generate().unwrap();
        assert_ne!(a.public_key(), b.public_key());
    }
}
