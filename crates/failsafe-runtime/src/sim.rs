//! Simulated watched nodes for headless runs and CI.
//!
//! A [`SimulatedNode`] is the node side of one bond: it runs its own
//! [`LivenessLink`] end against the supervisor, listens on the safety topic,
//! and records how it would react to a supervisor command.  A
//! [`SimulatedFleet`] spawns one node per ladder identity and replays a
//! scripted [`SimulatedFault`] plan against them, so the whole supervisor can
//! be exercised without any external process.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use failsafe_kernel::SupervisorConfig;
//! use failsafe_middleware::{HeartbeatBus, SafetyBus};
//! use failsafe_runtime::sim::{FaultKind, SimulatedFleet};
//!
//! # async fn demo() -> Result<(), failsafe_types::FailsafeError> {
//! let config = SupervisorConfig::with_bond_ids(["planner", "controller"]);
//! let channel = Arc::new(HeartbeatBus::default());
//! let mut fleet = SimulatedFleet::spawn(&config, channel, SafetyBus::default())?;
//! fleet.inject("controller", FaultKind::Crash).await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use failsafe_kernel::{BondWatcher, LadderMember, SupervisorConfig, WatcherStatus};
use failsafe_middleware::{
    Delivery, HeartbeatChannel, LinkTiming, LivenessLink, SafetyBus, SafetyReceiver,
};
use failsafe_types::{Directive, FailsafeError, LinkState, NodeIdentity, SafetyMessage};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{error, info, warn};

/// What a node does once the supervisor restricts it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reaction {
    /// The supervisor named this node: it is now the most trusted level.
    TakeControl,
    /// FATAL was published or the bond to the supervisor broke.
    Stop,
}

// ─────────────────────────────────────────────────────────────────────────────
// SimulatedNode
// ─────────────────────────────────────────────────────────────────────────────

/// Node side of one bond.
pub struct SimulatedNode {
    watcher: BondWatcher,
    reaction: watch::Receiver<Option<Reaction>>,
    listener: JoinHandle<()>,
}

impl SimulatedNode {
    /// Create the node's link end, connect it, and start listening for
    /// supervisor commands on `bus`.
    pub fn spawn(
        channel: Arc<dyn HeartbeatChannel>,
        bus: SafetyBus,
        session: &str,
        id: NodeIdentity,
        timing: LinkTiming,
    ) -> Self {
        let link = LivenessLink::new(channel, session, id.clone(), timing);
        let (tx, reaction) = watch::channel(None);
        let listener = tokio::spawn(listen(id, bus.subscribe(), link.subscribe(), tx));

        let watcher = BondWatcher::new(link, bus);
        watcher.link().connect();
        info!(node = %watcher.identity(), "simulated node up");

        Self {
            watcher,
            reaction,
            listener,
        }
    }

    pub fn identity(&self) -> &NodeIdentity {
        self.watcher.identity()
    }

    pub fn link_state(&self) -> LinkState {
        self.watcher.link().state()
    }

    /// The node's own view of its flag pair.
    pub fn status(&self) -> WatcherStatus {
        self.watcher.status()
    }

    /// The reaction recorded so far, if any.
    pub fn reaction(&self) -> Option<Reaction> {
        *self.reaction.borrow()
    }

    /// Wait until the node reacts.  `None` if the listener ended without a
    /// reaction.
    pub async fn reacted(&self) -> Option<Reaction> {
        let mut rx = self.reaction.clone();
        let seen = match rx.wait_for(Option::is_some).await {
            Ok(reaction) => *reaction,
            Err(_) => None,
        };
        seen.or_else(|| *rx.borrow())
    }

    /// Resolve once this node's own watcher has gone safety-active.
    pub async fn restricted(&self) -> WatcherStatus {
        self.watcher.restricted().await
    }

    /// Announce degraded operation: the node publishes its own identity.
    pub fn report_degraded(&self) -> Result<usize, FailsafeError> {
        warn!(node = %self.identity(), "reporting degraded operation");
        self.watcher.report(Directive::Node(self.identity().clone()))
    }

    /// Announce an unrecoverable failure.
    pub fn report_fatal(&self) -> Result<usize, FailsafeError> {
        error!(node = %self.identity(), "reporting fatal failure");
        self.watcher.report(Directive::Fatal)
    }

    /// Die without a farewell: the supervisor only notices through heartbeat
    /// silence.
    pub fn crash(self) {
        warn!(node = %self.identity(), "simulated crash");
    }

    /// Leave deliberately: the farewell frame breaks the bond at once.
    pub async fn exit(self) {
        info!(node = %self.identity(), "simulated node exiting");
        self.watcher.link().sever().await;
    }
}

impl Drop for SimulatedNode {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

async fn listen(
    id: NodeIdentity,
    mut inbox: SafetyReceiver,
    mut link: watch::Receiver<LinkState>,
    out: watch::Sender<Option<Reaction>>,
) {
    let (reaction, why) = loop {
        tokio::select! {
            delivery = inbox.recv() => match delivery {
                Delivery::Event(event) => match event.message {
                    SafetyMessage::Command(Directive::Fatal) => {
                        break (Reaction::Stop, "FATAL received");
                    }
                    SafetyMessage::Command(Directive::Node(target)) if target == id => {
                        break (Reaction::TakeControl, "named by the supervisor");
                    }
                    _ => {}
                },
                Delivery::Lagged(_) => break (Reaction::Stop, "safety messages dropped"),
                Delivery::Closed => return,
            },
            _ = async { link.wait_for(|s| *s == LinkState::Broken).await.is_ok() } => {
                break (Reaction::Stop, "bond to the supervisor broken");
            }
        }
    };

    match reaction {
        Reaction::TakeControl => warn!(node = %id, why, "taking control"),
        Reaction::Stop => error!(node = %id, why, "stopping"),
    }
    out.send_replace(Some(reaction));
}

// ─────────────────────────────────────────────────────────────────────────────
// Fault plan
// ─────────────────────────────────────────────────────────────────────────────

/// Kind of fault a simulated node can suffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    /// Publish a self-report naming the node.
    Degraded,
    /// Publish FATAL.
    Fatal,
    /// Stop heartbeating without a farewell.
    Crash,
    /// Sever the bond with a farewell frame.
    Exit,
}

/// One scripted fault, applied `after_sec` seconds into the plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulatedFault {
    pub node: String,
    pub after_sec: f64,
    pub kind: FaultKind,
}

impl SimulatedFault {
    fn delay(&self) -> Result<Duration, FailsafeError> {
        Duration::try_from_secs_f64(self.after_sec).map_err(|e| {
            FailsafeError::Config(format!(
                "fault for {} has an invalid delay {}: {e}",
                self.node, self.after_sec
            ))
        })
    }
}

/// One simulated node per ladder identity, in ladder order.
pub struct SimulatedFleet {
    nodes: Vec<SimulatedNode>,
}

impl SimulatedFleet {
    /// Spawn a node for every identity in `config`.
    ///
    /// # Errors
    ///
    /// [`FailsafeError::Config`] when the identity list is invalid.
    pub fn spawn(
        config: &SupervisorConfig,
        channel: Arc<dyn HeartbeatChannel>,
        bus: SafetyBus,
    ) -> Result<Self, FailsafeError> {
        let nodes = config
            .identities()?
            .into_iter()
            .map(|id| {
                SimulatedNode::spawn(
                    Arc::clone(&channel),
                    bus.clone(),
                    &config.session,
                    id,
                    config.timing,
                )
            })
            .collect();
        Ok(Self { nodes })
    }

    /// Nodes still running.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&SimulatedNode> {
        self.nodes.iter().find(|node| node.identity().as_str() == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SimulatedNode> {
        self.nodes.iter()
    }

    /// Apply `kind` to the node called `name`.  Crashed and exited nodes
    /// leave the fleet.
    ///
    /// # Errors
    ///
    /// [`FailsafeError::Config`] for an unknown node, or
    /// [`FailsafeError::Channel`] if a report could not be published.
    pub async fn inject(&mut self, name: &str, kind: FaultKind) -> Result<(), FailsafeError> {
        let index = self
            .nodes
            .iter()
            .position(|node| node.identity().as_str() == name)
            .ok_or_else(|| FailsafeError::Config(format!("no simulated node called {name}")))?;

        match kind {
            FaultKind::Degraded => {
                self.nodes[index].report_degraded()?;
            }
            FaultKind::Fatal => {
                self.nodes[index].report_fatal()?;
            }
            FaultKind::Crash => self.nodes.remove(index).crash(),
            FaultKind::Exit => self.nodes.remove(index).exit().await,
        }
        Ok(())
    }

    /// Replay `faults` in time order, measured from the call.  Returns early
    /// when `shutdown` turns `true` or its sender is dropped.
    ///
    /// # Errors
    ///
    /// [`FailsafeError::Config`] for a negative or non-finite delay or an
    /// unknown node.
    pub async fn run_plan(
        &mut self,
        faults: &[SimulatedFault],
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), FailsafeError> {
        let mut plan = faults
            .iter()
            .map(|fault| Ok((fault.delay()?, fault)))
            .collect::<Result<Vec<_>, FailsafeError>>()?;
        plan.sort_by_key(|(delay, _)| *delay);

        let start = Instant::now();
        for (delay, fault) in plan {
            tokio::select! {
                _ = time::sleep_until(start + delay) => {}
                _ = async { shutdown.wait_for(|stop| *stop).await.is_ok() } => {
                    info!("fault plan interrupted by shutdown");
                    return Ok(());
                }
            }
            info!(node = %fault.node, kind = ?fault.kind, "injecting simulated fault");
            self.inject(&fault.node, fault.kind).await?;
        }
        Ok(())
    }
}
