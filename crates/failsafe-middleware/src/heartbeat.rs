//! The heartbeat channel seam.
//!
//! Bonds never talk to a concrete transport.  They publish and consume
//! [`Heartbeat`] frames through a [`HeartbeatChannel`]; the process wiring
//! decides what carries them.
//!
//! - [`HeartbeatChannel`] – the trait every heartbeat transport implements.
//! - [`HeartbeatBus`] – in-process implementation on a Tokio broadcast
//!   channel, used when the supervisor and its nodes share a runtime (the
//!   simulator, the tests).

use async_trait::async_trait;
use failsafe_types::{FailsafeError, Heartbeat};
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use tokio::sync::broadcast;
use tracing::warn;

/// Frames buffered per subscriber before the slowest one starts lagging.
const DEFAULT_CAPACITY: usize = 1024;

/// Every heartbeat transport must implement this trait.
///
/// # Contract
///
/// * `publish` – hands one frame to every current subscriber of the channel.
///   Frames for all sessions share the channel; receivers filter by
///   `(session, id)`.
/// * `subscribe` – a live stream of frames published after the call.  The
///   stream ends when the transport shuts down.
#[async_trait]
pub trait HeartbeatChannel: Send + Sync {
    async fn publish(&self, beat: Heartbeat) -> Result<(), FailsafeError>;

    fn subscribe(&self) -> BoxStream<'static, Heartbeat>;
}

/// In-process [`HeartbeatChannel`]. Clones share the same channel.
#[derive(Clone, Debug)]
pub struct HeartbeatBus {
    sender: broadcast::Sender<Heartbeat>,
}

impl HeartbeatBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }
}

impl Default for HeartbeatBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[async_trait]
impl HeartbeatChannel for HeartbeatBus {
    async fn publish(&self, beat: Heartbeat) -> Result<(), FailsafeError> {
        self.sender
            .send(beat)
            .map(|_| ())
            .map_err(|e| FailsafeError::Channel(format!("heartbeat send error: {e}")))
    }

    fn subscribe(&self) -> BoxStream<'static, Heartbeat> {
        let receiver = self.sender.subscribe();
        futures_util::stream::unfold(receiver, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(beat) => return Some((beat, receiver)),
                    // Heartbeats are periodic; a dropped frame is replaced by
                    // the next one.
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(lagged_by = n, "heartbeat subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }
}
