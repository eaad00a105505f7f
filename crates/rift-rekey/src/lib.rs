//! Periodic authenticated key rotation for RIFT sessions.
//!
//! This crate provides:
//! - X25519 ephemeral key agreement with low-order point rejection
//! - Ed25519-signed exchange messages (fixed 96-byte wire record)
//! - Optional pre-shared key mixing into every derived secret
//! - A [`KeyExchanger`] that drives rotation rounds on a timer and hands
//!   fresh secrets to the owning session
//!
//! # Design
//!
//! The exchanger sits on top of an already established message channel
//! ([`Transport`]). It does not encrypt application data; it only produces
//! 32-byte secrets through [`RotationListener::on_secret`]. Fatal
//! conditions (bad peer key, send failure, no round within
//! `interval + timeout`) close the exchanger and are reported exactly once
//! through [`RotationListener::on_error`].

#![forbid(unsafe_code)]

pub mod agreement;
pub mod config;
pub mod error;
pub mod exchanger;
pub mod identity;
pub mod message;
pub mod psk;
pub mod transport;

pub use agreement::{AgreementError, EphemeralKeyPair};
pub use config::KeyExchangeOptions;
pub use error::{KeyExchangeError, Result};
pub use exchanger::{KeyExchanger, RotationListener, RoundPhase};
pub use identity::{IdentityKeypair, KeyFingerprint, LocalIdentity, PublicIdentity, RemoteIdentity};
pub use message::{DecodeError, ExchangeMessage, MESSAGE_SIZE};
pub use psk::{Psk, SharedSecret};
pub use transport::{MessageHandler, Transport, TransportError};
