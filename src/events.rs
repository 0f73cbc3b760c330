//! Lifecycle notifications for external observability.
//!
//! Subscribers receive every [`Notification`] published after they
//! subscribed. Publishing never blocks and never fails when nobody listens.

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

/// Lifecycle events emitted by the bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent {
    /// Socket connected to the worker.
    Connected { port: u16 },
    /// Socket lost or torn down.
    Disconnected { reason: String },
    /// A failure worth surfacing: frame errors, failed recovery.
    Error { message: String },
    /// Worker announced its port.
    WorkerStarted { pid: Option<u32>, port: u16 },
    /// Worker exited. `expected` is false for crashes and external kills.
    WorkerExited { status: String, expected: bool },
    /// Reconnect to the same worker scheduled.
    Reconnecting,
    /// Worker restart scheduled.
    Restarting,
    /// `stop()` completed.
    Stopped,
}

/// A timestamped [`BridgeEvent`].
#[derive(Debug, Clone)]
pub struct Notification {
    pub at: DateTime<Utc>,
    pub event: BridgeEvent,
}

/// Broadcast fan-out of notifications.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Notification>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn emit(&self, event: BridgeEvent) {
        tracing::trace!(?event, "Publishing bridge event");
        // Err only means there are no subscribers.
        let _ = self.sender.send(Notification {
            at: Utc::now(),
            event,
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.sender.subscribe()
    }
}
