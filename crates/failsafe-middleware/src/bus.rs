//! The shared safety topic.
//!
//! One [`tokio::sync::broadcast`] channel carries every [`SafetyEvent`]:
//! supervisor commands and node self-reports travel over the same lane, and
//! every subscriber (including the supervisor's own watchers) receives every
//! message.
//!
//! Publication is rare but must not be lost once a restriction fires, so the
//! channel never buffers fewer than [`MIN_CAPACITY`] events per subscriber.

use failsafe_types::{FailsafeError, SafetyEvent, SafetyMessage};
use tokio::sync::broadcast;
use tracing::warn;

/// Smallest burst the topic must absorb before a slow subscriber lags.
pub const MIN_CAPACITY: usize = 100;

/// Shared safety topic. Clone it cheaply – all clones share the same
/// underlying broadcast channel.
#[derive(Clone, Debug)]
pub struct SafetyBus {
    sender: broadcast::Sender<SafetyEvent>,
}

impl SafetyBus {
    /// Create a new bus. Capacities below [`MIN_CAPACITY`] are raised to it.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(MIN_CAPACITY));
        Self { sender }
    }

    /// Publish `event` to every subscriber.
    ///
    /// Returns the number of receivers that were handed the event, or
    /// [`FailsafeError::Channel`] when nobody is listening.
    pub fn publish(&self, event: SafetyEvent) -> Result<usize, FailsafeError> {
        self.sender
            .send(event)
            .map_err(|e| FailsafeError::Channel(format!("safety bus send error: {e}")))
    }

    /// Wrap `message` in a fresh [`SafetyEvent`] tagged with `source` and
    /// publish it.
    pub fn publish_message(
        &self,
        source: &str,
        message: SafetyMessage,
    ) -> Result<usize, FailsafeError> {
        self.publish(SafetyEvent::new(source, message))
    }

    /// Subscribe to every event published from now on.
    pub fn subscribe(&self) -> SafetyReceiver {
        SafetyReceiver {
            receiver: self.sender.subscribe(),
        }
    }
}

impl Default for SafetyBus {
    fn default() -> Self {
        Self::new(MIN_CAPACITY)
    }
}

/// Outcome of a single [`SafetyReceiver::recv`].
#[derive(Debug)]
pub enum Delivery {
    Event(SafetyEvent),
    /// The subscriber fell behind and `n` events were dropped.
    Lagged(u64),
    /// Every sender is gone; no further events will arrive.
    Closed,
}

/// An async receiver on the safety topic.
///
/// Obtained via [`SafetyBus::subscribe`].
pub struct SafetyReceiver {
    receiver: broadcast::Receiver<SafetyEvent>,
}

impl SafetyReceiver {
    /// Wait for the next delivery.
    ///
    /// Lag is surfaced instead of skipped: a receiver that dropped events may
    /// have missed a restriction, and only the caller can decide how to fail
    /// closed.
    pub async fn recv(&mut self) -> Delivery {
        match self.receiver.recv().await {
            Ok(event) => Delivery::Event(event),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(lagged_by = n, "SafetyReceiver lagged");
                Delivery::Lagged(n)
            }
            Err(broadcast::error::RecvError::Closed) => Delivery::Closed,
        }
    }
}
