//! [`SafetySupervisor`] – the fold-and-publish loop.
//!
//! At startup the supervisor forms one bond per configured identity, in ladder
//! order.  Then, every tick:
//!
//! 1. **Fold** – every member's flag pair is folded into the lowest safe
//!    priority (see [`ladder`][crate::ladder]).
//! 2. **Check** – the result must lie in `[-1, N-1]`; anything else is an
//!    [`FailsafeError::InvariantViolation`] and stops the loop.
//! 3. **Publish** – a restriction publishes the identity that should hold
//!    control, `-1` publishes `FATAL`, and a nominal ladder publishes nothing.
//!
//! The lowest safe priority only ever goes down.  A ladder that recovers does
//! not regain authority; a restart with fresh bonds is required.
//!
//! # Startup failure
//!
//! If any bond fails to form, no further bonds are attempted and the
//! supervisor starts in the FATAL state: every tick then publishes `FATAL` so
//! that every listener, bonded or not, stops.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use failsafe_kernel::{SafetySupervisor, SupervisorConfig};
//! use failsafe_middleware::{HeartbeatBus, SafetyBus};
//!
//! # async fn demo() -> Result<(), failsafe_types::FailsafeError> {
//! let config = SupervisorConfig::with_bond_ids(["planner", "controller", "fallback"]);
//! let bus = SafetyBus::new(config.topic_capacity);
//! let mut supervisor =
//!     SafetySupervisor::start(&config, bus, Arc::new(HeartbeatBus::default())).await?;
//! let (_stop, shutdown) = tokio::sync::watch::channel(false);
//! supervisor.run(shutdown).await?;
//! # Ok(())
//! # }
//! ```

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use failsafe_middleware::bus::MIN_CAPACITY;
use failsafe_middleware::{HeartbeatChannel, LinkTiming, LivenessLink, SafetyBus};
use failsafe_types::{Directive, FailsafeError, NodeIdentity, SafetyMessage};
use tokio::sync::watch;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::decision::Decision;
use crate::ladder::{FATAL_PRIORITY, PriorityLadder, check_priority_range, fold_lowest_safe_priority};
use crate::watcher::{BondWatcher, LadderMember, WatcherStatus};

/// Heartbeat session name shared by the supervisor and every node.
pub const DEFAULT_SESSION: &str = "bond_topic";

const SOURCE: &str = "failsafe-kernel::supervisor";

/// Slack allowed when comparing a loop period derived from a frequency
/// against a third of the heartbeat period.
const LOOP_PERIOD_SLACK: Duration = Duration::from_micros(1);

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Configuration bundle for [`SafetySupervisor`].
#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorConfig {
    /// Ladder identities, highest authority first.
    pub bond_ids: Vec<String>,
    /// Heartbeat session name.
    pub session: String,
    /// Heartbeat cadence and deadlines applied to every bond.
    pub timing: LinkTiming,
    /// Interval between ticks.  Must be at most a third of the heartbeat
    /// period.
    pub loop_period: Duration,
    /// Safety topic buffer.
    pub topic_capacity: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        let timing = LinkTiming::default();
        Self {
            bond_ids: Vec::new(),
            session: DEFAULT_SESSION.to_string(),
            timing,
            loop_period: timing.heartbeat_period / 3,
            topic_capacity: MIN_CAPACITY,
        }
    }
}

impl SupervisorConfig {
    /// Default configuration for the given ladder.
    pub fn with_bond_ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            bond_ids: ids.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Parse and check the ladder identities.
    ///
    /// # Errors
    ///
    /// [`FailsafeError::Config`] when the list is empty, contains an invalid
    /// or reserved name, or repeats a name.
    pub fn identities(&self) -> Result<Vec<NodeIdentity>, FailsafeError> {
        if self.bond_ids.is_empty() {
            return Err(FailsafeError::Config("bond id list is empty".into()));
        }
        let mut seen = HashSet::new();
        self.bond_ids
            .iter()
            .map(|raw| {
                let id = NodeIdentity::new(raw.as_str())?;
                if !seen.insert(id.clone()) {
                    return Err(FailsafeError::Config(format!("bond id {id} is listed twice")));
                }
                Ok(id)
            })
            .collect()
    }

    /// Check the whole configuration.
    ///
    /// # Errors
    ///
    /// [`FailsafeError::Config`] describing the first problem found.
    pub fn validate(&self) -> Result<(), FailsafeError> {
        self.identities()?;

        let LinkTiming {
            heartbeat_period,
            heartbeat_timeout,
            connect_timeout,
        } = self.timing;
        if heartbeat_period.is_zero() {
            return Err(FailsafeError::Config("heartbeat period must be positive".into()));
        }
        if heartbeat_timeout <= heartbeat_period {
            return Err(FailsafeError::Config(format!(
                "heartbeat timeout {heartbeat_timeout:?} must exceed heartbeat period {heartbeat_period:?}"
            )));
        }
        if connect_timeout.is_zero() {
            return Err(FailsafeError::Config("connect timeout must be positive".into()));
        }
        if self.loop_period.is_zero()
            || self.loop_period > heartbeat_period / 3 + LOOP_PERIOD_SLACK
        {
            return Err(FailsafeError::Config(format!(
                "loop period {:?} must be positive and at most a third of the heartbeat period {heartbeat_period:?}",
                self.loop_period
            )));
        }
        if self.topic_capacity < MIN_CAPACITY {
            return Err(FailsafeError::Config(format!(
                "topic capacity {} is below the minimum of {MIN_CAPACITY}",
                self.topic_capacity
            )));
        }
        if self.session.trim().is_empty() {
            return Err(FailsafeError::Config("session name must not be empty".into()));
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// SafetySupervisor
// ─────────────────────────────────────────────────────────────────────────────

/// Owns the ladder and the lowest safe priority.
pub struct SafetySupervisor<M = BondWatcher> {
    ladder: PriorityLadder<M>,
    lowest_safe_priority: i32,
    bus: SafetyBus,
    loop_period: Duration,
    startup_failure: Option<NodeIdentity>,
    last_published: Option<Directive>,
    /// Last flag pair logged per member; a change is logged at `error!`.
    observed: Vec<WatcherStatus>,
}

impl SafetySupervisor<BondWatcher> {
    /// Form every bond in ladder order and build the supervisor.
    ///
    /// A bond that fails to form stops startup: it is kept as the last ladder
    /// member, no further bonds are attempted, and the supervisor starts in
    /// the FATAL state (see [`startup_failure`][Self::startup_failure]).
    ///
    /// # Errors
    ///
    /// [`FailsafeError::Config`] if `config` does not validate.
    pub async fn start(
        config: &SupervisorConfig,
        bus: SafetyBus,
        channel: Arc<dyn HeartbeatChannel>,
    ) -> Result<Self, FailsafeError> {
        config.validate()?;
        let identities = config.identities()?;

        let mut lowest_safe_priority = i32::try_from(identities.len())
            .map_err(|_| FailsafeError::Config("too many bond ids".into()))?
            - 1;
        let mut startup_failure = None;
        let mut watchers = Vec::with_capacity(identities.len());

        for id in identities {
            info!(bond = %id, "starting bond");
            let link = LivenessLink::new(Arc::clone(&channel), &config.session, id.clone(), config.timing);
            let watcher = BondWatcher::new(link, bus.clone());
            let formed = watcher.form_bond().await;
            watchers.push(watcher);

            if !formed {
                let err = FailsafeError::StartupBondFailure {
                    identity: id.to_string(),
                };
                error!(error = %err, "aborting startup; no further bonds will be attempted");
                lowest_safe_priority = FATAL_PRIORITY;
                startup_failure = Some(id);
                break;
            }
        }

        let ladder = PriorityLadder::new(watchers)?;
        info!(
            members = ladder.len(),
            lowest_safe_priority, "safety supervisor started"
        );
        let observed = vec![WatcherStatus::NOMINAL; ladder.len()];
        Ok(Self {
            ladder,
            lowest_safe_priority,
            bus,
            loop_period: config.loop_period,
            startup_failure,
            last_published: None,
            observed,
        })
    }
}

impl<M: LadderMember> SafetySupervisor<M> {
    /// Supervise an already-built ladder, starting from the nominal priority.
    ///
    /// # Errors
    ///
    /// [`FailsafeError::Config`] when `loop_period` is zero.
    pub fn from_ladder(
        ladder: PriorityLadder<M>,
        bus: SafetyBus,
        loop_period: Duration,
    ) -> Result<Self, FailsafeError> {
        if loop_period.is_zero() {
            return Err(FailsafeError::Config("loop period must be positive".into()));
        }
        let lowest_safe_priority = ladder.nominal_priority();
        let observed = vec![WatcherStatus::NOMINAL; ladder.len()];
        Ok(Self {
            ladder,
            lowest_safe_priority,
            bus,
            loop_period,
            startup_failure: None,
            last_published: None,
            observed,
        })
    }

    /// Run one fold-check-publish cycle.
    ///
    /// # Errors
    ///
    /// [`FailsafeError::InvariantViolation`] when the fold leaves the legal
    /// range.  The stored priority is left untouched in that case.
    pub fn tick(&mut self) -> Result<Decision, FailsafeError> {
        let statuses = self.ladder.statuses();
        for &(index, status) in &statuses {
            if !(status.safety_active || status.fatal_active) {
                continue;
            }
            let bond = self
                .ladder
                .get(index)
                .map(|member| member.identity().as_str());
            let changed = self.observed.get(index).is_none_or(|seen| *seen != status);
            if changed {
                error!(
                    priority = index,
                    bond,
                    safety = status.safety_active,
                    fatal = status.fatal_active,
                    "restriction read while checking bond"
                );
            } else {
                debug!(
                    priority = index,
                    bond,
                    safety = status.safety_active,
                    fatal = status.fatal_active,
                    "restriction still active"
                );
            }
            if let Some(seen) = self.observed.get_mut(index) {
                *seen = status;
            }
        }

        let folded = fold_lowest_safe_priority(self.lowest_safe_priority, statuses);
        let lowest = check_priority_range(folded, self.ladder.len()).inspect_err(|e| {
            error!(error = %e, "lowest safe priority outside of possible range");
        })?;

        if lowest < self.lowest_safe_priority {
            warn!(
                from = self.lowest_safe_priority,
                to = lowest,
                "lowest safe priority lowered"
            );
        }
        self.lowest_safe_priority = lowest;

        let decision = Decision::from_priority(lowest, &self.ladder)?;
        self.publish(&decision);
        Ok(decision)
    }

    /// Tick at the configured loop period until `shutdown` turns `true` (or
    /// its sender is dropped).
    ///
    /// Dropping the supervisor afterwards lets every bond lapse, which the
    /// watched nodes treat as FATAL.
    ///
    /// # Errors
    ///
    /// Propagates [`FailsafeError::InvariantViolation`] from [`tick`][Self::tick].
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), FailsafeError> {
        let mut ticker = time::interval(self.loop_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(period = ?self.loop_period, "safety loop running");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick()?;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!(lowest_safe_priority = self.lowest_safe_priority, "safety loop stopping");
                        return Ok(());
                    }
                }
            }
        }
    }

    pub fn lowest_safe_priority(&self) -> i32 {
        self.lowest_safe_priority
    }

    pub fn is_fatal(&self) -> bool {
        self.lowest_safe_priority == FATAL_PRIORITY
    }

    /// The bond that failed to form during startup, if any.
    pub fn startup_failure(&self) -> Option<&NodeIdentity> {
        self.startup_failure.as_ref()
    }

    pub fn ladder(&self) -> &PriorityLadder<M> {
        &self.ladder
    }

    fn publish(&mut self, decision: &Decision) {
        let Some(directive) = decision.directive() else {
            return;
        };

        if let Err(e) = self
            .bus
            .publish_message(SOURCE, SafetyMessage::Command(directive.clone()))
        {
            warn!(error = %e, %directive, "safety decision had no listeners");
        }

        if self.last_published.as_ref() == Some(&directive) {
            debug!(%directive, "safety decision republished");
            return;
        }
        match decision {
            Decision::Restrict { priority, identity } => {
                error!(priority, bond = %identity, "safety event");
            }
            Decision::Fatal => {
                error!(priority = FATAL_PRIORITY, "FATAL event");
            }
            Decision::Nominal => {}
        }
        self.last_published = Some(directive);
    }
}
