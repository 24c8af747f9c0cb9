//! [`BondWatcher`] – one watched node as seen through its bond and the safety
//! topic.
//!
//! A watcher owns one [`LivenessLink`] and one subscription to the
//! [`SafetyBus`].  A background handler task is the only writer of the
//! watcher's flag pair:
//!
//! | Input | Effect |
//! |---|---|
//! | payload equal to the watcher's own identity | `safety_active` |
//! | payload `FATAL` | `safety_active` + `fatal_active` |
//! | link enters `Broken` | `safety_active` + `fatal_active` |
//! | subscription lagged | `safety_active` |
//!
//! Flags only ever go up.  Both message kinds (`Command` and `SelfReport`)
//! follow the same rule, so a supervisor decision naming a node is heard by
//! that node's watcher on the next delivery.
//!
//! The flag pair lives in one atomic word so the supervisor tick always reads
//! both flags from the same instant.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use failsafe_middleware::{Delivery, LivenessLink, SafetyBus, SafetyReceiver};
use failsafe_types::{Directive, FailsafeError, LinkState, NodeIdentity, SafetyMessage};
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const SAFETY: u8 = 0b01;
const FATAL: u8 = 0b10;

/// Snapshot of a watcher's flag pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WatcherStatus {
    pub safety_active: bool,
    pub fatal_active: bool,
}

impl WatcherStatus {
    pub const NOMINAL: Self = Self {
        safety_active: false,
        fatal_active: false,
    };
    pub const SAFETY: Self = Self {
        safety_active: true,
        fatal_active: false,
    };
    pub const FATAL: Self = Self {
        safety_active: true,
        fatal_active: true,
    };

    fn from_bits(bits: u8) -> Self {
        Self {
            safety_active: bits & SAFETY != 0,
            fatal_active: bits & FATAL != 0,
        }
    }
}

/// A member of a [`PriorityLadder`][crate::ladder::PriorityLadder]: anything
/// that can name itself and report its current flag pair.
pub trait LadderMember: Send + Sync {
    fn identity(&self) -> &NodeIdentity;

    fn status(&self) -> WatcherStatus;
}

struct Flags {
    bits: AtomicU8,
    raised: Notify,
}

impl Flags {
    /// Set `mask`; returns `true` if any bit was newly set.
    fn raise(&self, mask: u8) -> bool {
        let previous = self.bits.fetch_or(mask, Ordering::AcqRel);
        let changed = (previous | mask) != previous;
        if changed {
            self.raised.notify_waiters();
        }
        changed
    }

    fn status(&self) -> WatcherStatus {
        WatcherStatus::from_bits(self.bits.load(Ordering::Acquire))
    }
}

/// Watches one node through its bond and the shared safety topic.
pub struct BondWatcher {
    identity: NodeIdentity,
    link: LivenessLink,
    bus: SafetyBus,
    flags: Arc<Flags>,
    handler: JoinHandle<()>,
}

impl BondWatcher {
    /// Subscribe to `bus` and start the handler task on the current Tokio
    /// runtime.  The link is not connected until [`form_bond`][Self::form_bond].
    pub fn new(link: LivenessLink, bus: SafetyBus) -> Self {
        let identity = link.id().clone();
        let flags = Arc::new(Flags {
            bits: AtomicU8::new(0),
            raised: Notify::new(),
        });
        let handler = tokio::spawn(handle(
            identity.clone(),
            bus.subscribe(),
            link.subscribe(),
            Arc::clone(&flags),
        ));
        Self {
            identity,
            link,
            bus,
            flags,
            handler,
        }
    }

    /// Connect the link and wait until it forms or breaks.
    ///
    /// Returns `true` when the bond formed.  The wait is an `await` on the
    /// link's state, so the heartbeat task keeps running meanwhile.
    pub async fn form_bond(&self) -> bool {
        info!(bond = %self.identity, "trying to form bond");
        self.link.connect();
        match self.link.wait_settled().await {
            LinkState::Formed => {
                info!(bond = %self.identity, "made bond");
                true
            }
            state => {
                error!(bond = %self.identity, ?state, "could not make bond");
                false
            }
        }
    }

    /// `true` if the node reported itself, FATAL was published, or the bond
    /// is broken.
    pub fn is_safety_active(&self) -> bool {
        self.status().safety_active
    }

    /// `true` if FATAL was published or the bond is broken.
    pub fn is_fatal_active(&self) -> bool {
        self.status().fatal_active
    }

    pub fn is_formed(&self) -> bool {
        self.link.is_formed()
    }

    pub fn is_broken(&self) -> bool {
        self.link.is_broken()
    }

    /// Publish a self-report about the watched node on the safety topic.
    pub fn report(&self, directive: Directive) -> Result<usize, FailsafeError> {
        let source = format!("failsafe-node::{}", self.identity);
        self.bus
            .publish_message(&source, SafetyMessage::SelfReport(directive))
    }

    /// Resolve once `safety_active` is set, i.e. this node has been told to
    /// take control or stop.  Returns the status at that moment.
    pub async fn restricted(&self) -> WatcherStatus {
        loop {
            let raised = self.flags.raised.notified();
            let status = self.status();
            if status.safety_active {
                return status;
            }
            raised.await;
        }
    }

    pub fn link(&self) -> &LivenessLink {
        &self.link
    }
}

impl LadderMember for BondWatcher {
    fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    fn status(&self) -> WatcherStatus {
        // The handler raises both flags on break, but it may not have run
        // yet; reading the link closes that window.
        if self.link.is_broken() {
            return WatcherStatus::FATAL;
        }
        self.flags.status()
    }
}

impl Drop for BondWatcher {
    fn drop(&mut self) {
        self.handler.abort();
    }
}

async fn handle(
    identity: NodeIdentity,
    mut inbox: SafetyReceiver,
    mut link_state: watch::Receiver<LinkState>,
    flags: Arc<Flags>,
) {
    let mut bus_open = true;
    let mut link_live = true;

    while bus_open || link_live {
        tokio::select! {
            delivery = inbox.recv(), if bus_open => match delivery {
                Delivery::Event(event) => apply(&identity, &flags, event.message.directive()),
                Delivery::Lagged(n) => {
                    error!(bond = %identity, dropped = n, "safety messages dropped; assuming safety event");
                    flags.raise(SAFETY);
                }
                Delivery::Closed => {
                    debug!(bond = %identity, "safety topic closed");
                    bus_open = false;
                }
            },
            broke = async { link_state.wait_for(|s| *s == LinkState::Broken).await.is_ok() }, if link_live => {
                link_live = false;
                if broke && flags.raise(SAFETY | FATAL) {
                    let err = FailsafeError::LinkBroken { identity: identity.to_string() };
                    error!(error = %err, "safety and fatal active");
                }
            }
        }
    }
}

fn apply(identity: &NodeIdentity, flags: &Flags, directive: &Directive) {
    match directive {
        Directive::Fatal => {
            if flags.raise(SAFETY | FATAL) {
                error!(bond = %identity, "FATAL received");
            }
        }
        Directive::Node(target) if target == identity => {
            if flags.raise(SAFETY) {
                warn!(bond = %identity, "safety event for this node");
            }
        }
        Directive::Node(_) => {}
    }
}
