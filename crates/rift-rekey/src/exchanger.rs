//! Periodic authenticated key rotation.
//!
//! A [`KeyExchanger`] owns one staged ephemeral X25519 key pair. It signs
//! and sends the public half over the transport, and combines the private
//! half with each authenticated public key the peer sends back. Every
//! successful combination yields a fresh [`SharedSecret`] for the owning
//! session.
//!
//! # Round timing
//!
//! Once at start and then on every tick the exchanger looks at the time
//! since the last completed round:
//!
//! ```text
//!  never / elapsed >= interval          -> Due: sign and send our key
//!  elapsed < interval                   -> Quiescent: nothing to do
//!  elapsed > interval + timeout         -> Expired: close, report Timeout
//! ```
//!
//! A due peer resends every tick until a reply completes the round. A peer
//! that accepts a valid key answers with its own key unless it already sent
//! that key since the previous accepted message, so the side that is due
//! gets a reply without waiting for the other side's interval. Every chain
//! of answers ends after at most two hops, even when started by a replayed
//! message.
//!
//! # Locking
//!
//! All mutable state lives behind one mutex. It is never held while the
//! transport sends or while the listener runs, so listeners may call back
//! into the exchanger.

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::agreement::{EphemeralKeyPair, KEY_SIZE};
use crate::config::KeyExchangeOptions;
use crate::error::{KeyExchangeError, Result};
use crate::identity::{LocalIdentity, RemoteIdentity};
use crate::message::{ExchangeMessage, MESSAGE_SIZE};
use crate::psk::{derive_secret, SharedSecret};
use crate::transport::{MessageHandler, Transport};

/// Receives the results of key rotation.
///
/// Neither method is called while the exchanger's lock is held.
pub trait RotationListener: Send + Sync {
    /// A round produced a new secret.
    fn on_secret(&self, secret: SharedSecret);

    /// The exchanger hit a fatal error and closed itself. Called at most
    /// once per exchanger.
    fn on_error(&self, error: KeyExchangeError);
}

/// Where the exchanger stands relative to its last completed round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundPhase {
    /// The last round is fresh.
    Quiescent,
    /// A round is needed; send our key.
    Due,
    /// No round completed within `interval + timeout`.
    Expired { elapsed: Duration },
}

impl RoundPhase {
    pub fn evaluate(
        last_exchange: Option<Instant>,
        now: Instant,
        interval: Duration,
        timeout: Duration,
    ) -> Self {
        let Some(last) = last_exchange else {
            return Self::Due;
        };

        let elapsed = now.saturating_duration_since(last);
        if elapsed < interval {
            Self::Quiescent
        } else if elapsed > interval + timeout {
            Self::Expired { elapsed }
        } else {
            Self::Due
        }
    }
}

struct RotationState {
    /// Signature rejections since the last completed round.
    fail_count: u32,
    last_exchange: Option<Instant>,
    /// Our key went out after the last accepted peer key.
    sent_since_accept: bool,
    next_key: Option<EphemeralKeyPair>,
    local_message: ExchangeMessage,
    remote_message: ExchangeMessage,
}

/// What an accepted inbound message asks of us once the lock is dropped.
struct Completion {
    secret: SharedSecret,
    reply: Option<[u8; MESSAGE_SIZE]>,
}

struct Inner {
    state: Mutex<RotationState>,
    options: KeyExchangeOptions,
    local: Arc<dyn LocalIdentity>,
    remote: Arc<dyn RemoteIdentity>,
    transport: Arc<dyn Transport>,
    listener: Arc<dyn RotationListener>,
    /// Flips to `true` exactly once.
    cancel: watch::Sender<bool>,
    /// Set once the loop has exited and the transport is closed.
    stopped: watch::Sender<bool>,
}

impl Inner {
    fn new(
        transport: Arc<dyn Transport>,
        local: Arc<dyn LocalIdentity>,
        remote: Arc<dyn RemoteIdentity>,
        listener: Arc<dyn RotationListener>,
        options: KeyExchangeOptions,
    ) -> Self {
        Self {
            state: Mutex::new(RotationState {
                fail_count: 0,
                last_exchange: None,
                sent_since_accept: false,
                next_key: None,
                local_message: ExchangeMessage::default(),
                remote_message: ExchangeMessage::default(),
            }),
            options,
            local,
            remote,
            transport,
            listener,
            cancel: watch::channel(false).0,
            stopped: watch::channel(false).0,
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, RotationState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn is_closed(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Request cancellation. Returns `true` only for the call that did it.
    fn cancel(&self) -> bool {
        self.cancel.send_if_modified(|closed| {
            if *closed {
                false
            } else {
                *closed = true;
                true
            }
        })
    }

    /// Close and report `err`, unless someone else already closed us.
    fn fail(&self, err: KeyExchangeError) {
        if self.cancel() {
            warn!(peer = %self.remote.fingerprint(), "key exchange failed: {}", err);
            self.listener.on_error(err);
        } else {
            debug!("key exchanger already closed, dropping error: {}", err);
        }
    }

    fn update_key(&self) -> Result<()> {
        if self.is_closed() {
            return Err(KeyExchangeError::Closed);
        }

        match EphemeralKeyPair::generate() {
            Ok(pair) => {
                self.lock_state().next_key = Some(pair);
                debug!("staged new ephemeral key");
                Ok(())
            }
            Err(err) => {
                self.fail(err.clone().into());
                Err(err.into())
            }
        }
    }

    /// Sign the staged public key into the local message slot.
    ///
    /// Returns `None` when no key is staged.
    fn sign_local(&self, state: &mut RotationState) -> Option<[u8; MESSAGE_SIZE]> {
        let key = state.next_key.as_ref()?;
        state
            .local_message
            .fill_signed(key.public_key(), self.local.as_ref());
        state.sent_since_accept = true;
        Some(state.local_message.encode())
    }

    fn send_public_key(&self) -> Result<()> {
        let wire = {
            let mut state = self.lock_state();
            self.sign_local(&mut state)
        };

        let Some(wire) = wire else {
            debug!("no ephemeral key staged, skipping send");
            return Ok(());
        };

        debug!("sending ephemeral public key");
        self.transport.send(&wire)?;
        Ok(())
    }

    fn iterate(&self) {
        if self.is_closed() {
            return;
        }

        let last_exchange = self.lock_state().last_exchange;
        let phase = RoundPhase::evaluate(
            last_exchange,
            Instant::now(),
            self.options.interval(),
            self.options.timeout(),
        );
        debug!("key exchanger iteration: {:?}", phase);

        match phase {
            RoundPhase::Quiescent => {}
            RoundPhase::Expired { elapsed } => self.fail(KeyExchangeError::Timeout { elapsed }),
            RoundPhase::Due => {
                if let Err(err) = self.send_public_key() {
                    self.fail(err);
                }
            }
        }
    }

    /// Decode, authenticate and combine one inbound message.
    ///
    /// `Ok(None)` means the message was dropped without completing a round.
    fn accept(&self, bytes: &[u8]) -> Result<Option<Completion>> {
        let mut guard = self.lock_state();
        let state = &mut *guard;

        state.remote_message = ExchangeMessage::decode(bytes)?;

        if let Err(err) = state.remote_message.verify(self.remote.as_ref()) {
            state.fail_count = state.fail_count.saturating_add(1);
            debug!(peer = %self.remote.fingerprint(), "wrong signature: {}", err);
            return Ok(None);
        }

        let Some(key) = state.next_key.as_ref() else {
            debug!("no ephemeral key staged yet, ignoring peer key");
            return Ok(None);
        };

        let raw = key.combine(&state.remote_message.public_key)?;
        let secret = derive_secret(&raw, self.options.psk());

        let reply = if state.sent_since_accept {
            None
        } else {
            self.sign_local(state)
        };
        state.sent_since_accept = reply.is_some();

        state.last_exchange = Some(Instant::now());
        state.fail_count = 0;

        Ok(Some(Completion { secret, reply }))
    }

    async fn run(self: Arc<Self>) {
        let tick = self.options.tick();
        let mut ticker = tokio::time::interval_at(Instant::now() + tick, tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut cancel = self.cancel.subscribe();

        while !*cancel.borrow_and_update() {
            tokio::select! {
                changed = cancel.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = ticker.tick() => self.iterate(),
            }
        }

        if let Err(err) = self.transport.close() {
            debug!("failed to close transport: {}", err);
        }
        self.stopped.send_replace(true);
        debug!("key exchanger stopped");
    }
}

impl MessageHandler for Inner {
    fn handle_message(&self, bytes: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(KeyExchangeError::Closed);
        }

        let completion = match self.accept(bytes) {
            Ok(Some(completion)) => completion,
            Ok(None) => return Ok(()),
            Err(err @ KeyExchangeError::Decode(_)) => return Err(err),
            Err(err) => {
                self.fail(err);
                return Ok(());
            }
        };

        info!(peer = %self.remote.fingerprint(), "key exchange round completed");
        self.listener.on_secret(completion.secret);

        if let Some(reply) = completion.reply {
            debug!("answering peer key with ours");
            if let Err(err) = self.transport.send(&reply) {
                self.fail(err.into());
            }
        }
        Ok(())
    }
}

/// Background key rotation bound to one transport and peer.
///
/// Dropping the exchanger closes it.
pub struct KeyExchanger {
    inner: Arc<Inner>,
}

impl KeyExchanger {
    /// Start rotating keys over `transport`.
    ///
    /// Stages the first ephemeral key, registers as the transport's inbound
    /// handler, attempts one round right away and spawns the periodic loop
    /// on the current tokio runtime. Failures after this point go to
    /// `listener`.
    ///
    /// Messages the transport queued before registration are handled during
    /// registration. If one of them completes a round, that round's answer
    /// carries our key and the immediate attempt finds the round fresh and
    /// sends nothing.
    pub fn start(
        transport: Arc<dyn Transport>,
        local: Arc<dyn LocalIdentity>,
        remote: Arc<dyn RemoteIdentity>,
        listener: Arc<dyn RotationListener>,
        options: KeyExchangeOptions,
    ) -> Result<Self> {
        options.validate()?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| KeyExchangeError::config(format!("no tokio runtime: {e}")))?;

        let inner = Arc::new(Inner::new(transport, local, remote, listener, options));

        // A generation failure is already reported through the listener.
        let _ = inner.update_key();

        let handler: Weak<Inner> = Arc::downgrade(&inner);
        inner.transport.set_handler(handler);

        inner.iterate();
        runtime.spawn(inner.clone().run());

        debug!(peer = %inner.remote.fingerprint(), "key exchanger started");
        Ok(Self { inner })
    }

    /// Feed one inbound message, as the transport would.
    ///
    /// Bad signatures and messages that arrive before a key is staged are
    /// dropped silently. Only malformed input and use after close are
    /// returned as errors.
    pub fn handle_inbound_message(&self, bytes: &[u8]) -> Result<()> {
        self.inner.handle_message(bytes)
    }

    /// Replace the staged ephemeral key pair.
    ///
    /// The exchanger never rotates its own key after a round. The owning
    /// session must call this after consuming each secret to get forward
    /// secrecy on the local side.
    pub fn update_key(&self) -> Result<()> {
        self.inner.update_key()
    }

    /// Stop the loop and close the transport. Idempotent; never reported
    /// through the listener.
    pub fn close(&self) {
        if self.inner.cancel() {
            debug!("key exchanger closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Wait until the loop has exited and the transport is closed.
    pub async fn closed(&self) {
        let mut stopped = self.inner.stopped.subscribe();
        let _ = stopped.wait_for(|stopped| *stopped).await;
    }

    /// Time of the last completed round.
    pub fn last_exchange(&self) -> Option<Instant> {
        self.inner.lock_state().last_exchange
    }

    pub fn fail_count(&self) -> u32 {
        self.inner.lock_state().fail_count
    }

    /// Public half of the staged ephemeral key.
    pub fn local_public_key(&self) -> Option<[u8; KEY_SIZE]> {
        self.inner
            .lock_state()
            .next_key
            .as_ref()
            .map(|key| *key.public_key())
    }

    pub fn options(&self) -> &KeyExchangeOptions {
        &self.inner.options
    }
}

impl Drop for KeyExchanger {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for KeyExchanger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyExchanger")
            .field("peer", &self.inner.remote.fingerprint())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentityKeypair;
    use crate::transport::memory::{self, MemoryTransport};

    #[derive(Default)]
    struct Recorder {
        secrets: Mutex<Vec<SharedSecret>>,
        errors: Mutex<Vec<KeyExchangeError>>,
    }

    impl RotationListener for Recorder {
        fn on_secret(&self, secret: SharedSecret) {
            self.secrets.lock().unwrap().push(secret);
        }

        fn on_error(&self, error: KeyExchangeError) {
            self.errors.lock().unwrap().push(error);
        }
    }

    struct Fixture {
        inner: Inner,
        recorder: Arc<Recorder>,
        transport: Arc<MemoryTransport>,
        peer_identity: IdentityKeypair,
    }

    /// An exchanger that has not been started: no key staged, no loop.
    fn fixture(options: KeyExchangeOptions) -> Fixture {
        let (transport, _peer) = memory::pair();
        let local = Arc::new(IdentityKeypair::generate());
        let peer_identity = IdentityKeypair::generate();
        let recorder = Arc::new(Recorder::default());
        let inner = Inner::new(
            transport.clone(),
            local,
            Arc::new(peer_identity.public_identity()),
            recorder.clone(),
            options,
        );
        Fixture {
            inner,
            recorder,
            transport,
            peer_identity,
        }
    }

    fn signed_by(identity: &IdentityKeypair, public_key: &[u8; 32]) -> [u8; MESSAGE_SIZE] {
        let mut msg = ExchangeMessage::default();
        msg.fill_signed(public_key, identity);
        msg.encode()
    }

    #[test]
    fn test_round_phase() {
        let now = Instant::now();
        let interval = Duration::from_millis(200);
        let timeout = Duration::from_millis(200);
        let ago = |ms| Some(now - Duration::from_millis(ms));

        assert_eq!(RoundPhase::evaluate(None, now, interval, timeout), RoundPhase::Due);
        assert_eq!(
            RoundPhase::evaluate(ago(199), now, interval, timeout),
            RoundPhase::Quiescent
        );
        assert_eq!(RoundPhase::evaluate(ago(200), now, interval, timeout), RoundPhase::Due);
        assert_eq!(RoundPhase::evaluate(ago(400), now, interval, timeout), RoundPhase::Due);
        assert_eq!(
            RoundPhase::evaluate(ago(401), now, interval, timeout),
            RoundPhase::Expired {
                elapsed: Duration::from_millis(401)
            }
        );
    }

    #[test]
    fn test_not_ready_guard() {
        let f = fixture(KeyExchangeOptions::default());
        let peer_key = EphemeralKeyPair::generate().unwrap();

        let wire = signed_by(&f.peer_identity, peer_key.public_key());
        assert!(f.inner.handle_message(&wire).is_ok());

        assert!(f.recorder.secrets.lock().unwrap().is_empty());
        assert!(f.recorder.errors.lock().unwrap().is_empty());
        assert!(f.inner.lock_state().last_exchange.is_none());
    }

    #[test]
    fn test_short_message_is_decode_error() {
        let f = fixture(KeyExchangeOptions::default());
        f.inner.update_key().unwrap();
        let staged = *f.inner.lock_state().next_key.as_ref().unwrap().public_key();

        for len in [0, 31, 95] {
            let result = f.inner.handle_message(&vec![7u8; len]);
            assert!(matches!(result, Err(KeyExchangeError::Decode(_))));
        }

        let state = f.inner.lock_state();
        assert_eq!(state.next_key.as_ref().unwrap().public_key(), &staged);
        assert!(state.last_exchange.is_none());
        assert_eq!(state.remote_message, ExchangeMessage::default());
        drop(state);
        assert!(!f.inner.is_closed());
    }

    #[test]
    fn test_bad_signature_dropped() {
        let f = fixture(KeyExchangeOptions::default());
        f.inner.update_key().unwrap();

        let mallory = IdentityKeypair::generate();
        let peer_key = EphemeralKeyPair::generate().unwrap();
        let wire = signed_by(&mallory, peer_key.public_key());

        assert!(f.inner.handle_message(&wire).is_ok());
        assert!(f.recorder.secrets.lock().unwrap().is_empty());
        assert!(f.recorder.errors.lock().unwrap().is_empty());
        assert!(f.inner.lock_state().last_exchange.is_none());
        assert_eq!(f.inner.lock_state().fail_count, 1);
    }

    #[test]
    fn test_valid_message_completes_round() {
        let f = fixture(KeyExchangeOptions::default());
        f.inner.update_key().unwrap();
        let peer_key = EphemeralKeyPair::generate().unwrap();

        let wire = signed_by(&f.peer_identity, peer_key.public_key());
        f.inner.handle_message(&wire).unwrap();

        let local_public = *f.inner.lock_state().next_key.as_ref().unwrap().public_key();
        let expected = peer_key.combine(&local_public).unwrap();
        let secrets = f.recorder.secrets.lock().unwrap();
        assert_eq!(secrets.len(), 1);
        assert_eq!(secrets[0].as_bytes(), &*expected);
        assert!(f.inner.lock_state().last_exchange.is_some());
    }

    #[test]
    fn test_answers_alternate() {
        let f = fixture(KeyExchangeOptions::default());
        f.inner.update_key().unwrap();
        let peer_key = EphemeralKeyPair::generate().unwrap();
        let wire = signed_by(&f.peer_identity, peer_key.public_key());

        // First key is answered, the same key again is not.
        f.inner.handle_message(&wire).unwrap();
        assert_eq!(f.transport.sent_count(), 1);
        f.inner.handle_message(&wire).unwrap();
        assert_eq!(f.transport.sent_count(), 1);
        f.inner.handle_message(&wire).unwrap();
        assert_eq!(f.transport.sent_count(), 2);
        assert_eq!(f.recorder.secrets.lock().unwrap().len(), 3);
    }

    #[test]
    fn test_no_answer_after_own_send() {
        let f = fixture(KeyExchangeOptions::default());
        f.inner.update_key().unwrap();
        f.inner.iterate();
        assert_eq!(f.transport.sent_count(), 1);

        let peer_key = EphemeralKeyPair::generate().unwrap();
        f.inner
            .handle_message(&signed_by(&f.peer_identity, peer_key.public_key()))
            .unwrap();
        assert_eq!(f.transport.sent_count(), 1);
        assert!(f.inner.lock_state().last_exchange.is_some());
    }

    #[test]
    fn test_low_order_key_closes_and_reports_once() {
        let f = fixture(KeyExchangeOptions::default());
        f.inner.update_key().unwrap();

        let wire = signed_by(&f.peer_identity, &[0u8; 32]);
        assert!(f.inner.handle_message(&wire).is_ok());
        assert!(f.inner.is_closed());

        assert!(matches!(
            f.inner.handle_message(&wire),
            Err(KeyExchangeError::Closed)
        ));
        let errors = f.recorder.errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], KeyExchangeError::Agreement(_)));
    }

    #[test]
    fn test_send_failure_is_fatal() {
        let f = fixture(KeyExchangeOptions::default());
        f.inner.update_key().unwrap();
        f.transport.set_failing(true);

        f.inner.iterate();

        assert!(f.inner.is_closed());
        let errors = f.recorder.errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], KeyExchangeError::Transmission(_)));
    }

    #[test]
    fn test_fail_after_close_suppressed() {
        let f = fixture(KeyExchangeOptions::default());
        assert!(f.inner.cancel());
        assert!(!f.inner.cancel());

        f.inner.fail(KeyExchangeError::Timeout {
            elapsed: Duration::from_secs(1),
        });
        assert!(f.recorder.errors.lock().unwrap().is_empty());
        assert!(matches!(f.inner.update_key(), Err(KeyExchangeError::Closed)));
    }

    #[test]
    fn test_update_key_replaces_staged_key() {
        let f = fixture(KeyExchangeOptions::default());
        f.inner.update_key().unwrap();
        let first = *f.inner.lock_state().next_key.as_ref().unwrap().public_key();
        f.inner.update_key().unwrap();
        let second = *f.inner.lock_state().next_key.as_ref().unwrap().public_key();
        assert_ne!(first, second);
    }

    #[test]
    fn test_concurrent_cancel_single_winner() {
        let f = Arc::new(fixture(KeyExchangeOptions::default()));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let f = f.clone();
                std::thread::spawn(move || f.inner.cancel())
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }
}
