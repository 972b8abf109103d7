//! Broadcast Channel
//!
//! Cross-process communication primitive: fire-and-forget, at-most-once per
//! send. The engine treats the channel strictly as message passing — never a
//! lock or a source of truth. Message loss is tolerated because the periodic
//! consistency audit, not the broadcast, is the backstop.
//!
//! [`LoopbackHub`] wires several in-process "processes" to one shared
//! channel, which is how the multi-process tests simulate cooperating tabs.

use bytes::Bytes;
use tokio::sync::broadcast;

use crate::error::Result;

/// Default buffered message capacity for loopback channels
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// A `BroadcastChannel`-like primitive: best-effort send plus a subscription
/// stream of raw payloads.
pub trait BroadcastChannel: Send + Sync {
    /// Send a payload to every subscribed process. Best-effort: delivery is
    /// at-most-once and failures are reported, not retried.
    fn send(&self, payload: Bytes) -> Result<()>;

    /// Subscribe to payloads sent on this channel. Depending on the
    /// implementation the subscriber may also see its own sends echoed back;
    /// consumers deduplicate by event identity.
    fn subscribe(&self) -> broadcast::Receiver<Bytes>;
}

/// In-process hub connecting multiple loopback channels, one per simulated
/// process.
pub struct LoopbackHub {
    sender: broadcast::Sender<Bytes>,
}

impl LoopbackHub {
    /// Create a hub with default capacity
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a hub buffering up to `capacity` undelivered messages
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Create a channel attached to this hub
    pub fn channel(&self) -> LoopbackChannel {
        LoopbackChannel {
            sender: self.sender.clone(),
        }
    }
}

impl Default for LoopbackHub {
    fn default() -> Self {
        Self::new()
    }
}

/// One process's endpoint on a [`LoopbackHub`]. Sends are echoed back to the
/// sender's own subscribers as well, which exercises the consumers' dedup.
#[derive(Clone)]
pub struct LoopbackChannel {
    sender: broadcast::Sender<Bytes>,
}

impl BroadcastChannel for LoopbackChannel {
    fn send(&self, payload: Bytes) -> Result<()> {
        // No subscribers is not a failure: a lone process has no peers and
        // fire-and-forget semantics tolerate the loss.
        let _ = self.sender.send(payload);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<Bytes> {
        self.sender.subscribe()
    }
}

/// Channel for deployments with no peer processes: sends vanish, the
/// subscription never yields.
pub struct NullChannel {
    sender: broadcast::Sender<Bytes>,
}

impl NullChannel {
    /// Create a null channel
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1);
        Self { sender }
    }
}

impl Default for NullChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl BroadcastChannel for NullChannel {
    fn send(&self, _payload: Bytes) -> Result<()> {
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<Bytes> {
        self.sender.subscribe()
    }
}

// =============================================================================
// Tests
// =============================================================================
