//! # Message Channels
//!
//! A minimal interface for moving wire values between execution contexts.
//!
//! ## Philosophy
//!
//! - **Value-Oriented**: a channel carries opaque [`WireValue`] trees. It
//!   knows nothing about frames, services, or correlation ids.
//! - **Fire-and-Forget**: `send` never waits for the peer. A call that wants
//!   an answer builds request/reply on top of this, not here.
//! - **Broadcast**: every subscription on the receiving side observes every
//!   message, in the order it was sent. Two dispatchers may share one channel
//!   and filter by service key.

use std::sync::Arc;
use std::sync::Mutex;

use tokio::sync::mpsc;
use veilpack::WireValue;

/// Errors at the channel layer.
#[derive(Debug, Clone)]
pub enum ChannelError {
    /// Every receiver that ever listened is gone; the message can no longer
    /// be delivered to anyone.
    Closed,
}

impl std::fmt::Display for ChannelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "Channel closed: all subscribers dropped"),
        }
    }
}

impl std::error::Error for ChannelError {}

pub type Result<T> = std::result::Result<T, ChannelError>;

/// A duplex-capable message conduit between two execution contexts, or
/// within one (loopback).
///
/// This trait is designed to be object-safe (`Arc<dyn Channel>`).
pub trait Channel: Send + Sync + 'static {
    /// Delivers a message to every active subscription on the peer side.
    ///
    /// Non-blocking. A message sent before anyone subscribed is dropped
    /// silently, matching browser `postMessage` semantics.
    fn send(&self, message: WireValue) -> Result<()>;

    /// Registers one more listener.
    ///
    /// Subscriptions coexist; each receives every message sent after it was
    /// created, FIFO per channel instance.
    fn subscribe(&self) -> Subscription;
}

/// The receiving end of one [`Channel::subscribe`] call.
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<WireValue>,
}

impl Subscription {
    /// Builds a subscription from a raw receiver; custom [`Channel`]
    /// implementations use this.
    pub fn new(rx: mpsc::UnboundedReceiver<WireValue>) -> Self {
        Self { rx }
    }

    /// Waits for the next message. `None` once the channel side is gone.
    pub async fn recv(&mut self) -> Option<WireValue> {
        self.rx.recv().await
    }
}

/// Fan-out core shared by the channel implementations: a list of live
/// subscriber senders, pruned as receivers drop.
struct Fanout {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<WireValue>>>,
}

impl Fanout {
    fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().push(tx);
        Subscription { rx }
    }

    fn publish(&self, message: &WireValue) -> Result<()> {
        let mut subscribers = self.lock();
        let had_subscribers = !subscribers.is_empty();
        subscribers.retain(|tx| tx.send(message.clone()).is_ok());
        if had_subscribers && subscribers.is_empty() {
            return Err(ChannelError::Closed);
        }
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<mpsc::UnboundedSender<WireValue>>> {
        // A poisoned lock only means another thread panicked mid-push;
        // the Vec itself is still coherent.
        match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// A channel that delivers messages to subscribers of the same instance.
///
/// Messages never leave the process. Used for mock wiring and isolated UI
/// development, where one dispatcher is both caller and callee.
pub struct LoopbackChannel {
    bus: Fanout,
}

impl LoopbackChannel {
    pub fn new() -> Self {
        Self { bus: Fanout::new() }
    }
}

impl Default for LoopbackChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl Channel for LoopbackChannel {
    fn send(&self, message: WireValue) -> Result<()> {
        self.bus.publish(&message)
    }

    fn subscribe(&self) -> Subscription {
        self.bus.subscribe()
    }
}

/// One endpoint of a linked pair modelling two execution contexts.
///
/// Messages sent on one endpoint fan out to every subscription of the other,
/// FIFO per direction. There is no ordering guarantee across two distinct
/// pairs.
pub struct PairChannel {
    local: Arc<Fanout>,
    remote: Arc<Fanout>,
}

impl PairChannel {
    /// Creates two connected endpoints.
    pub fn pair() -> (Self, Self) {
        let side_a = Arc::new(Fanout::new());
        let side_b = Arc::new(Fanout::new());

        let a = Self {
            local: Arc::clone(&side_a),
            remote: Arc::clone(&side_b),
        };
        let b = Self {
            local: side_b,
            remote: side_a,
        };
        (a, b)
    }
}

impl Channel for PairChannel {
    fn send(&self, message: WireValue) -> Result<()> {
        self.remote.publish(&message)
    }

    fn subscribe(&self) -> Subscription {
        self.local.subscribe()
    }
}
