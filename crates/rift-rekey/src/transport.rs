//! Message transport capability.
//!
//! The exchanger does not frame or retransmit anything itself. It needs a
//! channel where one [`Transport::send`] produces one logical message at the
//! peer, and where every inbound logical message is handed to the single
//! registered [`MessageHandler`].

use std::sync::Weak;

use thiserror::Error;

use crate::error::KeyExchangeError;

/// Transport errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,

    #[error("transport I/O error: {0}")]
    Io(String),
}

/// Receiver of inbound logical messages.
pub trait MessageHandler: Send + Sync {
    fn handle_message(&self, message: &[u8]) -> Result<(), KeyExchangeError>;
}

/// Outbound half of the channel plus handler registration.
pub trait Transport: Send + Sync {
    /// Send one logical message. May block on the write path.
    fn send(&self, message: &[u8]) -> Result<(), TransportError>;

    /// Register the inbound handler, replacing any previous one.
    ///
    /// The transport holds a weak reference so it never keeps the handler
    /// alive on its own.
    fn set_handler(&self, handler: Weak<dyn MessageHandler>);

    /// Close the channel. Must be idempotent.
    fn close(&self) -> Result<(), TransportError>;
}

pub mod memory {
    //! In-process transport pair.
    //!
    //! Messages are delivered synchronously on the sender's thread, so a
    //! `send` returns only after the peer's handler has run. Messages sent
    //! before the peer registers a handler are buffered and delivered on
    //! registration.

    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex, MutexGuard, Weak};

    use tracing::debug;

    use super::{MessageHandler, Transport, TransportError};

    #[derive(Default)]
    struct Inbox {
        handler: Option<Weak<dyn MessageHandler>>,
        pending: VecDeque<Vec<u8>>,
    }

    struct Link {
        inboxes: [Mutex<Inbox>; 2],
        closed: AtomicBool,
    }

    impl Link {
        fn inbox(&self, side: usize) -> MutexGuard<'_, Inbox> {
            match self.inboxes[side].lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            }
        }

        /// Deliver to `side`, or queue if nobody is listening there yet.
        fn deliver(&self, side: usize, message: &[u8]) -> Option<crate::Result<()>> {
            let handler = {
                let mut inbox = self.inbox(side);
                match inbox.handler.as_ref().and_then(Weak::upgrade) {
                    Some(handler) => handler,
                    None => {
                        inbox.pending.push_back(message.to_vec());
                        return None;
                    }
                }
            };
            Some(handler.handle_message(message))
        }
    }

    /// One endpoint of a [`pair`].
    pub struct MemoryTransport {
        link: Arc<Link>,
        side: usize,
        muted: AtomicBool,
        failing: AtomicBool,
        sent: AtomicUsize,
    }

    /// Create two connected endpoints.
    pub fn pair() -> (Arc<MemoryTransport>, Arc<MemoryTransport>) {
        let link = Arc::new(Link {
            inboxes: [Mutex::default(), Mutex::default()],
            closed: AtomicBool::new(false),
        });
        (
            Arc::new(MemoryTransport::new(link.clone(), 0)),
            Arc::new(MemoryTransport::new(link, 1)),
        )
    }

    impl MemoryTransport {
        fn new(link: Arc<Link>, side: usize) -> Self {
            Self {
                link,
                side,
                muted: AtomicBool::new(false),
                failing: AtomicBool::new(false),
                sent: AtomicUsize::new(0),
            }
        }

        /// Silently drop everything this endpoint sends.
        pub fn set_muted(&self, muted: bool) {
            self.muted.store(muted, Ordering::SeqCst);
        }

        /// Make every subsequent `send` fail with an I/O error.
        pub fn set_failing(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }

        /// Number of messages accepted by `send` (including muted ones).
        pub fn sent_count(&self) -> usize {
            self.sent.load(Ordering::SeqCst)
        }

        pub fn is_closed(&self) -> bool {
            self.link.closed.load(Ordering::SeqCst)
        }

        /// Hand `message` to this endpoint's handler as if the peer sent it.
        ///
        /// Returns `None` if the message was queued because no live handler
        /// is registered.
        pub fn inject(&self, message: &[u8]) -> Option<crate::Result<()>> {
            self.link.deliver(self.side, message)
        }
    }

    impl Transport for MemoryTransport {
        fn send(&self, message: &[u8]) -> Result<(), TransportError> {
            if self.is_closed() {
                return Err(TransportError::Closed);
            }
            if self.failing.load(Ordering::SeqCst) {
                return Err(TransportError::Io("injected send failure".into()));
            }
            self.sent.fetch_add(1, Ordering::SeqCst);
            if self.muted.load(Ordering::SeqCst) {
                return Ok(());
            }

            match self.link.deliver(1 - self.side, message) {
                Some(Err(err)) => debug!("peer rejected message: {}", err),
                Some(Ok(())) => {}
                None => debug!("no handler registered on peer, message queued"),
            }
            Ok(())
        }

        fn set_handler(&self, handler: Weak<dyn MessageHandler>) {
            let (live, pending) = {
                let mut inbox = self.link.inbox(self.side);
                inbox.handler = Some(handler.clone());
                (handler.upgrade(), std::mem::take(&mut inbox.pending))
            };

            let Some(live) = live else {
                return;
            };
            for message in pending {
                if let Err(err) = live.handle_message(&message) {
                    debug!("handler rejected queued message: {}", err);
                }
            }
        }

        fn close(&self) -> Result<(), TransportError> {
            self.link.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

}
