//! Process bootstrap for the safety supervisor.

use std::sync::Arc;

use failsafe_kernel::{SafetySupervisor, SupervisorConfig};
use failsafe_middleware::{HeartbeatChannel, SafetyBus};
use failsafe_types::{FailsafeError, NodeIdentity};
use tokio::sync::watch;
use tracing::{error, info, instrument};

/// How a supervised run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    /// Lowest safe priority at shutdown; `-1` is FATAL.
    pub lowest_safe_priority: i32,
    /// Ladder members that were actually bonded or attempted.
    pub members: usize,
    /// The bond that failed to form at startup, if any.
    pub startup_failure: Option<NodeIdentity>,
}

/// Form every bond, then run the safety loop until `shutdown` turns `true`.
///
/// A startup bond failure does not end the run: the supervisor keeps
/// publishing FATAL until shutdown.
///
/// # Errors
///
/// [`FailsafeError::Config`] for an invalid configuration and
/// [`FailsafeError::InvariantViolation`] if the loop leaves the legal
/// priority range.
#[instrument(skip_all, fields(bonds = config.bond_ids.len(), session = %config.session))]
pub async fn run_safety_node(
    config: &SupervisorConfig,
    channel: Arc<dyn HeartbeatChannel>,
    bus: SafetyBus,
    shutdown: watch::Receiver<bool>,
) -> Result<RunSummary, FailsafeError> {
    info!(bond_ids = ?config.bond_ids, "safety node starting");
    let mut supervisor = SafetySupervisor::start(config, bus, channel).await?;

    if let Some(failed) = supervisor.startup_failure() {
        let err = FailsafeError::StartupBondFailure {
            identity: failed.to_string(),
        };
        error!(error = %err, "publishing FATAL until shutdown");
    }

    supervisor.run(shutdown).await?;

    let summary = RunSummary {
        lowest_safe_priority: supervisor.lowest_safe_priority(),
        members: supervisor.ladder().len(),
        startup_failure: supervisor.startup_failure().cloned(),
    };
    info!(?summary, "safety node stopped");
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use failsafe_middleware::{HeartbeatBus, LinkTiming};
    use tokio::time;

    use crate::sim::{FaultKind, Reaction, SimulatedFleet};

    fn fast_config(ids: &[&str]) -> SupervisorConfig {
        SupervisorConfig {
            bond_ids: ids.iter().map(|s| s.to_string()).collect(),
            timing: LinkTiming {
                heartbeat_period: Duration::from_millis(30),
                heartbeat_timeout: Duration::from_millis(75),
                connect_timeout: Duration::from_millis(300),
            },
            loop_period: Duration::from_millis(10),
            ..SupervisorConfig::default()
        }
    }

    struct Harness {
        fleet: SimulatedFleet,
        stop: watch::Sender<bool>,
        run: tokio::task::JoinHandle<Result<RunSummary, FailsafeError>>,
    }

    fn launch(config: SupervisorConfig, nodes: &[&str]) -> Harness {
        let channel = Arc::new(HeartbeatBus::default());
        let bus = SafetyBus::new(config.topic_capacity);
        let fleet = SimulatedFleet::spawn(
            &SupervisorConfig {
                bond_ids: nodes.iter().map(|s| s.to_string()).collect(),
                ..config.clone()
            },
            channel.clone(),
            bus.clone(),
        )
        .unwrap();

        let (stop, shutdown) = watch::channel(false);
        let run = tokio::spawn(async move { run_safety_node(&config, channel, bus, shutdown).await });
        Harness { fleet, stop, run }
    }

    impl Harness {
        async fn finish(self) -> Result<RunSummary, FailsafeError> {
            self.stop.send(true).unwrap();
            self.run.await.unwrap()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn healthy_fleet_stays_nominal() {
        let harness = launch(fast_config(&["A", "B", "C"]), &["A", "B", "C"]);
        time::sleep(Duration::from_millis(500)).await;

        assert!(harness.fleet.iter().all(|n| n.reaction().is_none()));
        let summary = harness.finish().await.unwrap();
        assert_eq!(summary.lowest_safe_priority, 2);
        assert_eq!(summary.members, 3);
        assert_eq!(summary.startup_failure, None);
    }

    #[tokio::test(start_paused = true)]
    async fn crash_of_last_node_hands_control_one_up() {
        let mut harness = launch(fast_config(&["A", "B", "C"]), &["A", "B", "C"]);
        time::sleep(Duration::from_millis(200)).await;

        harness.fleet.inject("C", FaultKind::Crash).await.unwrap();
        let reaction = time::timeout(
            Duration::from_secs(1),
            harness.fleet.get("B").unwrap().reacted(),
        )
        .await
        .unwrap();
        assert_eq!(reaction, Some(Reaction::TakeControl));
        assert_eq!(harness.fleet.get("A").unwrap().reaction(), None);

        let summary = harness.finish().await.unwrap();
        assert_eq!(summary.lowest_safe_priority, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_report_from_top_node_stops_everyone() {
        let mut harness = launch(fast_config(&["A", "B"]), &["A", "B"]);
        time::sleep(Duration::from_millis(200)).await;

        harness.fleet.inject("A", FaultKind::Fatal).await.unwrap();
        for node in harness.fleet.iter() {
            let reaction = time::timeout(Duration::from_secs(1), node.reacted())
                .await
                .unwrap();
            assert_eq!(reaction, Some(Reaction::Stop));
        }

        let summary = harness.finish().await.unwrap();
        assert_eq!(summary.lowest_safe_priority, -1);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_node_at_startup_publishes_fatal_until_shutdown() {
        // "B" never comes up.
        let harness = launch(fast_config(&["A", "B"]), &["A"]);
        let reaction = time::timeout(
            Duration::from_secs(2),
            harness.fleet.get("A").unwrap().reacted(),
        )
        .await
        .unwrap();
        assert_eq!(reaction, Some(Reaction::Stop));

        let summary = harness.finish().await.unwrap();
        assert_eq!(summary.lowest_safe_priority, -1);
        assert_eq!(summary.members, 2);
        assert_eq!(summary.startup_failure.as_ref().map(NodeIdentity::as_str), Some("B"));
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_config_is_rejected_before_any_bond() {
        let (_stop, shutdown) = watch::channel(false);
        let mut config = fast_config(&["A"]);
        config.loop_period = Duration::from_millis(25);

        let result = run_safety_node(
            &config,
            Arc::new(HeartbeatBus::default()),
            SafetyBus::default(),
            shutdown,
        )
        .await;
        assert!(matches!(result, Err(FailsafeError::Config(_))));
    }
}
