//! [`LivenessLink`] – one end of a heartbeat bond.
//!
//! A bond is a named session keyed by `(session, id)`.  Both ends run a
//! [`LivenessLink`] with the same key; each one publishes a [`Heartbeat`]
//! every `heartbeat_period` and watches for frames from the other end.
//!
//! # State machine
//!
//! ```text
//! Pending ──first peer frame──► Formed
//!    │                            │
//!    │ connect_timeout            │ heartbeat_timeout / farewell / peer restart
//!    ▼                            ▼
//!  Broken ◄───────────────────────┘
//! ```
//!
//! `Broken` is terminal: once a bond breaks the link stops heartbeating and
//! never forms again, so the peer lapses into `Broken` too.  Restoring trust
//! requires a brand-new link.
//!
//! Dropping a link aborts its heartbeat task without a farewell frame; the
//! peer detects the silence and breaks on timeout.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use failsafe_types::{Heartbeat, LinkState, NodeIdentity};
use futures_util::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::heartbeat::HeartbeatChannel;

/// Heartbeat cadence and deadlines for one bond.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkTiming {
    /// Interval between outgoing heartbeats.
    pub heartbeat_period: Duration,
    /// Silence after the last peer frame that breaks a formed bond.
    pub heartbeat_timeout: Duration,
    /// How long the handshake may take before a pending bond breaks.
    pub connect_timeout: Duration,
}

impl Default for LinkTiming {
    fn default() -> Self {
        Self {
            heartbeat_period: Duration::from_millis(200),
            heartbeat_timeout: Duration::from_millis(500),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// One end of a heartbeat bond.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use failsafe_middleware::{HeartbeatBus, LinkTiming, LivenessLink};
/// use failsafe_types::{LinkState, NodeIdentity};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let channel = Arc::new(HeartbeatBus::default());
/// let id = NodeIdentity::new("planner").unwrap();
///
/// let supervisor_end = LivenessLink::new(channel.clone(), "bond_topic", id.clone(), LinkTiming::default());
/// let node_end = LivenessLink::new(channel, "bond_topic", id, LinkTiming::default());
/// supervisor_end.connect();
/// node_end.connect();
///
/// assert_eq!(supervisor_end.wait_settled().await, LinkState::Formed);
/// # }
/// ```
pub struct LivenessLink {
    session: String,
    id: NodeIdentity,
    instance: Uuid,
    timing: LinkTiming,
    channel: Arc<dyn HeartbeatChannel>,
    state: Arc<watch::Sender<LinkState>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LivenessLink {
    /// Create a link in [`LinkState::Pending`].  Nothing is sent until
    /// [`connect`][Self::connect] is called.
    pub fn new(
        channel: Arc<dyn HeartbeatChannel>,
        session: impl Into<String>,
        id: NodeIdentity,
        timing: LinkTiming,
    ) -> Self {
        let (state, _) = watch::channel(LinkState::Pending);
        Self {
            session: session.into(),
            id,
            instance: Uuid::new_v4(),
            timing,
            channel,
            state: Arc::new(state),
            task: Mutex::new(None),
        }
    }

    /// Start exchanging heartbeats on the current Tokio runtime.
    ///
    /// Calling `connect` on a link that is already connected, or already
    /// broken, does nothing.
    pub fn connect(&self) {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.is_some() || self.is_broken() {
            debug!(bond = %self.id, "connect ignored: link already started");
            return;
        }

        info!(bond = %self.id, session = %self.session, "starting heartbeat session");
        let session = Session {
            channel: Arc::clone(&self.channel),
            session: self.session.clone(),
            id: self.id.clone(),
            instance: self.instance,
            timing: self.timing,
            state: Arc::clone(&self.state),
        };
        *task = Some(tokio::spawn(session.run()));
    }

    /// Current state of the bond.
    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    pub fn is_formed(&self) -> bool {
        self.state() == LinkState::Formed
    }

    pub fn is_broken(&self) -> bool {
        self.state() == LinkState::Broken
    }

    /// Observe state transitions as they happen.
    pub fn subscribe(&self) -> watch::Receiver<LinkState> {
        self.state.subscribe()
    }

    /// Wait until the bond leaves [`LinkState::Pending`] and return the state
    /// it settled in.
    ///
    /// Yields to the scheduler while waiting, so the heartbeat task that
    /// delivers the transition keeps running on the same runtime.
    pub async fn wait_settled(&self) -> LinkState {
        let mut rx = self.state.subscribe();
        match rx.wait_for(|state| state.is_settled()).await {
            Ok(state) => *state,
            Err(_) => LinkState::Broken,
        }
    }

    /// Deliberately end the bond: send a farewell frame so the peer breaks
    /// immediately, stop heartbeating, and mark this end broken.
    pub async fn sever(&self) {
        if let Some(task) = self.task.lock().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
        }
        let farewell = Heartbeat {
            session: self.session.clone(),
            id: self.id.clone(),
            instance: self.instance,
            active: false,
            sent_at: Utc::now(),
        };
        if let Err(e) = self.channel.publish(farewell).await {
            debug!(bond = %self.id, error = %e, "farewell frame not delivered");
        }
        if transition(&self.state, LinkState::Broken) {
            warn!(bond = %self.id, "bond severed locally");
        }
    }

    pub fn id(&self) -> &NodeIdentity {
        &self.id
    }
}

impl Drop for LivenessLink {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Heartbeat task
// ─────────────────────────────────────────────────────────────────────────────

struct Session {
    channel: Arc<dyn HeartbeatChannel>,
    session: String,
    id: NodeIdentity,
    instance: Uuid,
    timing: LinkTiming,
    state: Arc<watch::Sender<LinkState>>,
}

impl Session {
    async fn run(self) {
        let mut inbound = self.channel.subscribe();
        let mut ticker = time::interval(self.timing.heartbeat_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let deadline = time::sleep(self.timing.connect_timeout);
        tokio::pin!(deadline);
        let mut peer: Option<Uuid> = None;

        let reason = loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.channel.publish(self.frame()).await {
                        debug!(bond = %self.id, error = %e, "heartbeat not delivered");
                    }
                }
                _ = &mut deadline => {
                    break if peer.is_some() {
                        "peer heartbeat timed out"
                    } else {
                        "handshake timed out"
                    };
                }
                frame = inbound.next() => {
                    let Some(beat) = frame else {
                        break "heartbeat channel closed";
                    };
                    if beat.session != self.session || beat.id != self.id || beat.instance == self.instance {
                        continue;
                    }
                    if !beat.active {
                        break "peer severed the bond";
                    }
                    match peer {
                        None => peer = Some(beat.instance),
                        Some(known) if known != beat.instance => break "peer restarted",
                        Some(_) => {}
                    }
                    deadline.as_mut().reset(Instant::now() + self.timing.heartbeat_timeout);
                    if transition(&self.state, LinkState::Formed) {
                        info!(bond = %self.id, "bond formed");
                    }
                }
            }
        };

        if transition(&self.state, LinkState::Broken) {
            warn!(bond = %self.id, reason, "bond broken");
        }
    }

    fn frame(&self) -> Heartbeat {
        Heartbeat {
            session: self.session.clone(),
            id: self.id.clone(),
            instance: self.instance,
            active: true,
            sent_at: Utc::now(),
        }
    }
}

/// Apply `next` unless the link is already broken or already in `next`.
/// Returns `true` when the state actually changed.
fn transition(state: &watch::Sender<LinkState>, next: LinkState) -> bool {
    state.send_if_modified(|current| {
        if *current == LinkState::Broken || *current == next {
            return false;
        }
        *current = next;
        true
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heartbeat::HeartbeatBus;

    fn timing() -> LinkTiming {
        LinkTiming {
            heartbeat_period: Duration::from_millis(20),
            heartbeat_timeout: Duration::from_millis(50),
            connect_timeout: Duration::from_millis(200),
        }
    }

    fn pair(channel: &Arc<HeartbeatBus>, id: &str) -> (LivenessLink, LivenessLink) {
        let id = NodeIdentity::new(id).unwrap();
        let a = LivenessLink::new(channel.clone(), "bond_topic", id.clone(), timing());
        let b = LivenessLink::new(channel.clone(), "bond_topic", id, timing());
        (a, b)
    }

    #[test]
    fn transition_refuses_to_leave_broken() {
        let (state, _) = watch::channel(LinkState::Pending);
        assert!(transition(&state, LinkState::Formed));
        assert!(!transition(&state, LinkState::Formed));
        assert!(transition(&state, LinkState::Broken));
        assert!(!transition(&state, LinkState::Formed));
        assert_eq!(*state.borrow(), LinkState::Broken);
    }

    #[tokio::test(start_paused = true)]
    async fn new_link_is_pending() {
        let channel = Arc::new(HeartbeatBus::default());
        let (a, _b) = pair(&channel, "planner");
        assert_eq!(a.state(), LinkState::Pending);
        assert!(!a.is_formed());
        assert!(!a.is_broken());
    }

    #[tokio::test(start_paused = true)]
    async fn both_ends_form_when_connected() {
        let channel = Arc::new(HeartbeatBus::default());
        let (a, b) = pair(&channel, "planner");
        a.connect();
        b.connect();

        assert_eq!(a.wait_settled().await, LinkState::Formed);
        assert_eq!(b.wait_settled().await, LinkState::Formed);
    }

    #[tokio::test(start_paused = true)]
    async fn handshake_times_out_without_peer() {
        let channel = Arc::new(HeartbeatBus::default());
        let (a, _never_connected) = pair(&channel, "planner");
        a.connect();

        let started = Instant::now();
        assert_eq!(a.wait_settled().await, LinkState::Broken);
        assert!(started.elapsed() >= timing().connect_timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn formed_bond_breaks_when_peer_goes_silent() {
        let channel = Arc::new(HeartbeatBus::default());
        let (a, b) = pair(&channel, "planner");
        a.connect();
        b.connect();
        assert_eq!(a.wait_settled().await, LinkState::Formed);

        let mut rx = a.subscribe();
        drop(b);

        let broke = rx.wait_for(|s| *s == LinkState::Broken).await.is_ok();
        assert!(broke);
    }

    #[tokio::test(start_paused = true)]
    async fn severed_peer_breaks_bond_immediately() {
        let channel = Arc::new(HeartbeatBus::default());
        let (a, b) = pair(&channel, "planner");
        a.connect();
        b.connect();
        assert_eq!(a.wait_settled().await, LinkState::Formed);

        let mut rx = a.subscribe();
        b.sever().await;
        assert!(b.is_broken());

        // Well before the heartbeat timeout could have fired.
        let result = time::timeout(
            Duration::from_millis(10),
            rx.wait_for(|s| *s == LinkState::Broken),
        )
        .await;
        assert!(result.is_ok(), "farewell frame must break the peer at once");
    }

    #[tokio::test(start_paused = true)]
    async fn broken_link_never_reforms() {
        let channel = Arc::new(HeartbeatBus::default());
        let (a, b) = pair(&channel, "planner");
        a.connect();
        b.connect();
        assert_eq!(a.wait_settled().await, LinkState::Formed);
        a.sever().await;

        // A fresh peer on the same key keeps heartbeating; `a` stays broken.
        let fresh = LivenessLink::new(channel.clone(), "bond_topic", a.id().clone(), timing());
        fresh.connect();
        a.connect();
        time::sleep(Duration::from_millis(300)).await;
        assert!(a.is_broken());
    }

    #[tokio::test(start_paused = true)]
    async fn frames_for_other_bonds_are_ignored() {
        let channel = Arc::new(HeartbeatBus::default());
        let (a, _) = pair(&channel, "planner");
        let (_, other) = pair(&channel, "controller");
        a.connect();
        other.connect();

        assert_eq!(a.wait_settled().await, LinkState::Broken);
    }

    #[tokio::test(start_paused = true)]
    async fn restarted_peer_breaks_bond() {
        let channel = Arc::new(HeartbeatBus::default());
        let (a, b) = pair(&channel, "planner");
        a.connect();
        b.connect();
        assert_eq!(a.wait_settled().await, LinkState::Formed);

        let mut rx = a.subscribe();
        drop(b);
        let restarted = LivenessLink::new(channel.clone(), "bond_topic", a.id().clone(), timing());
        restarted.connect();

        let broke = rx.wait_for(|s| *s == LinkState::Broken).await.is_ok();
        assert!(broke);
    }
}
