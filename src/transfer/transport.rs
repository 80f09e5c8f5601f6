//! Transport seam between the transfer engine and whatever carries bytes.
//!
//! The engine never talks to a socket directly. It holds a [`Channel`],
//! which is the send half of an ordered, reliable, message-oriented duplex
//! link plus two observations: the outbound backlog (for backpressure) and
//! closure. The inbound half is a plain `mpsc` receiver of
//! [`ChannelMessage`]s, delivered in send order.
//!
//! [`MemoryChannel`] is the in-process implementation. It carries both
//! directions over unbounded channels and exposes a [`BacklogHandle`] so
//! tests can simulate a congested wire without one existing.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};

use crate::error::SendlinkError;
use crate::transfer::protocol::ChannelMessage;

/// Send half of an ordered message channel.
///
/// Implementations must preserve send order and report closure promptly;
/// the engine relies on both.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Whether the channel can still accept messages.
    fn is_open(&self) -> bool;

    /// Queue one message for delivery. Fails with
    /// [`SendlinkError::TransportClosed`] once the channel has closed.
    async fn send(&self, msg: ChannelMessage) -> Result<(), SendlinkError>;

    /// Bytes queued locally but not yet handed to the wire.
    fn backlog_bytes(&self) -> u64;

    /// Resolve once the backlog has drained to `threshold` bytes or below.
    /// Does not resolve on closure; callers race this against [`closed`]
    /// with `tokio::select!`.
    ///
    /// [`closed`]: Channel::closed
    async fn drained(&self, threshold: u64);

    /// Resolve once the channel has closed, from either side.
    async fn closed(&self);
}

struct BacklogInner {
    bytes: AtomicU64,
    frozen: AtomicBool,
    notify: Notify,
}

/// Test-side control over a [`MemoryChannel`]'s simulated wire buffer.
///
/// While frozen, sent bytes accumulate in the backlog instead of draining
/// immediately, which is how a congested peer looks to the sender.
#[derive(Clone)]
pub struct BacklogHandle {
    inner: Arc<BacklogInner>,
}

impl BacklogHandle {
    /// Stop the simulated wire from consuming bytes.
    pub fn freeze(&self) {
        self.inner.frozen.store(true, Ordering::Release);
    }

    /// Shrink the backlog to `bytes`, waking any drain waiters.
    pub fn drain_to(&self, bytes: u64) {
        self.inner.bytes.store(bytes, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    /// Resume consumption and flush the accumulated backlog.
    pub fn release(&self) {
        self.inner.frozen.store(false, Ordering::Release);
        self.drain_to(0);
    }

    pub fn bytes(&self) -> u64 {
        self.inner.bytes.load(Ordering::Acquire)
    }
}

struct SharedState {
    closed: AtomicBool,
    close_notify: Notify,
}

/// In-process channel endpoint. Created in pairs; messages sent on one
/// endpoint arrive on the other's receiver in order. Closing either
/// endpoint closes both directions.
#[derive(Clone)]
pub struct MemoryChannel {
    outbound: mpsc::UnboundedSender<ChannelMessage>,
    backlog: Arc<BacklogInner>,
    shared: Arc<SharedState>,
}

impl MemoryChannel {
    /// Build a connected pair. Each side gets an endpoint for sending plus
    /// the receiver for messages the peer sends.
    #[allow(clippy::type_complexity)]
    pub fn pair() -> (
        (MemoryChannel, mpsc::UnboundedReceiver<ChannelMessage>),
        (MemoryChannel, mpsc::UnboundedReceiver<ChannelMessage>),
    ) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(SharedState {
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
        });

        let endpoint = |outbound| MemoryChannel {
            outbound,
            backlog: Arc::new(BacklogInner {
                bytes: AtomicU64::new(0),
                frozen: AtomicBool::new(false),
                notify: Notify::new(),
            }),
            shared: Arc::clone(&shared),
        };

        // a sends into b's receiver and vice versa
        ((endpoint(b_tx), a_rx), (endpoint(a_tx), b_rx))
    }

    /// Control handle for this endpoint's simulated wire buffer.
    pub fn backlog_handle(&self) -> BacklogHandle {
        BacklogHandle {
            inner: Arc::clone(&self.backlog),
        }
    }

    /// Close the channel. Subsequent sends on either endpoint fail and all
    /// closure waiters wake.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.close_notify.notify_waiters();
        // also wake drain waiters so their owning tasks can observe closure
        self.backlog.notify.notify_waiters();
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    fn is_open(&self) -> bool {
        !self.shared.closed.load(Ordering::Acquire)
    }

    async fn send(&self, msg: ChannelMessage) -> Result<(), SendlinkError> {
        if !self.is_open() {
            return Err(SendlinkError::TransportClosed);
        }
        if self.backlog.frozen.load(Ordering::Acquire) {
            self.backlog
                .bytes
                .fetch_add(msg.len() as u64, Ordering::AcqRel);
        }
        self.outbound
            .send(msg)
            .map_err(|_| SendlinkError::TransportClosed)
    }

    fn backlog_bytes(&self) -> u64 {
        self.backlog.bytes.load(Ordering::Acquire)
    }

    async fn drained(&self, threshold: u64) {
        loop {
            // register before checking so a concurrent drain is not missed
            let notified = self.backlog.notify.notified();
            if self.backlog_bytes() <= threshold || !self.is_open() {
                return;
            }
            notified.await;
        }
    }

    async fn closed(&self) {
        loop {
            let notified = self.shared.close_notify.notified();
            if !self.is_open() {
                return;
            }
            notified.await;
        }
    }
}
