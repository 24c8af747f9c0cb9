//! Supervisor configuration – reads `failsafe.toml` and `FAILSAFE_*` overrides.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use failsafe_kernel::{DEFAULT_SESSION, SupervisorConfig};
use failsafe_middleware::LinkTiming;
use failsafe_middleware::bus::MIN_CAPACITY;
use failsafe_runtime::SimulatedFault;
use failsafe_types::FailsafeError;
use serde::{Deserialize, Serialize};

/// File used when neither the command line nor `FAILSAFE_CONFIG` names one.
pub const DEFAULT_CONFIG_FILE: &str = "failsafe.toml";

/// On-disk configuration.  Every field has a default, so an empty file is
/// valid apart from the missing ladder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Ladder identities, highest authority first.
    #[serde(default)]
    pub bond_ids: Vec<String>,

    #[serde(default = "default_heartbeat_sec")]
    pub heartbeat_sec: f64,

    /// Silence that breaks a formed bond.
    #[serde(default = "default_timeout_sec")]
    pub timeout_sec: f64,

    /// How long each bond may take to form at startup.
    #[serde(default = "default_connect_timeout_sec")]
    pub connect_timeout_sec: f64,

    /// Supervisor tick rate.  Defaults to three ticks per heartbeat.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loop_hz: Option<f64>,

    #[serde(default = "default_session")]
    pub session: String,

    #[serde(default = "default_topic_capacity")]
    pub topic_capacity: usize,

    /// Spawn an in-process node for every ladder identity.
    #[serde(default)]
    pub simulate: bool,

    /// Faults replayed against the simulated nodes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub faults: Vec<SimulatedFault>,
}

fn default_heartbeat_sec() -> f64 {
    0.2
}
fn default_timeout_sec() -> f64 {
    0.5
}
fn default_connect_timeout_sec() -> f64 {
    10.0
}
fn default_session() -> String {
    DEFAULT_SESSION.to_string()
}
fn default_topic_capacity() -> usize {
    MIN_CAPACITY
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bond_ids: Vec::new(),
            heartbeat_sec: default_heartbeat_sec(),
            timeout_sec: default_timeout_sec(),
            connect_timeout_sec: default_connect_timeout_sec(),
            loop_hz: None,
            session: default_session(),
            topic_capacity: default_topic_capacity(),
            simulate: false,
            faults: Vec::new(),
        }
    }
}

impl Config {
    /// Convert to the kernel's configuration and validate it.
    ///
    /// # Errors
    ///
    /// [`FailsafeError::Config`] for non-positive or non-finite durations and
    /// anything [`SupervisorConfig::validate`] rejects.
    pub fn to_supervisor_config(&self) -> Result<SupervisorConfig, FailsafeError> {
        let timing = LinkTiming {
            heartbeat_period: seconds("heartbeat_sec", self.heartbeat_sec)?,
            heartbeat_timeout: seconds("timeout_sec", self.timeout_sec)?,
            connect_timeout: seconds("connect_timeout_sec", self.connect_timeout_sec)?,
        };
        let loop_period = match self.loop_hz {
            Some(hz) if hz > 0.0 => seconds("loop_hz", 1.0 / hz)?,
            Some(hz) => {
                return Err(FailsafeError::Config(format!(
                    "loop_hz must be positive, got {hz}"
                )));
            }
            None => timing.heartbeat_period / 3,
        };

        let config = SupervisorConfig {
            bond_ids: self.bond_ids.clone(),
            session: self.session.clone(),
            timing,
            loop_period,
            topic_capacity: self.topic_capacity,
        };
        config.validate()?;
        Ok(config)
    }
}

fn seconds(field: &str, value: f64) -> Result<Duration, FailsafeError> {
    Duration::try_from_secs_f64(value)
        .map_err(|e| FailsafeError::Config(format!("{field} = {value} is not a valid duration: {e}")))
}

/// Resolve the config path: the first command-line argument, then
/// `FAILSAFE_CONFIG`, then `./failsafe.toml`.
pub fn config_path(arg: Option<String>) -> PathBuf {
    resolve_path(arg, std::env::var("FAILSAFE_CONFIG").ok())
}

/// Extracted for testability without mutating environment variables.
pub(crate) fn resolve_path(arg: Option<String>, env: Option<String>) -> PathBuf {
    arg.or(env)
        .filter(|p| !p.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
}

/// Load `path`, falling back to defaults when it does not exist, then apply
/// environment overrides.
pub fn load(path: &Path) -> Result<Config, FailsafeError> {
    let mut cfg = load_from(path)?.unwrap_or_default();
    apply_env_overrides(&mut cfg);
    Ok(cfg)
}

/// Load the config from a specific path.  Returns `None` if the file does not
/// exist.
pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, FailsafeError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).map_err(|e| {
        FailsafeError::Config(format!("failed to read config at {}: {e}", path.display()))
    })?;
    let cfg = toml::from_str(&raw).map_err(|e| {
        FailsafeError::Config(format!("failed to parse config at {}: {e}", path.display()))
    })?;
    Ok(Some(cfg))
}

/// Apply `FAILSAFE_*` environment variable overrides to `cfg`.
///
/// Values that do not parse are ignored.
///
/// | Variable | Config field |
/// |---|---|
/// | `FAILSAFE_BOND_IDS` | `bond_ids` (comma-separated) |
/// | `FAILSAFE_HEARTBEAT_SEC` | `heartbeat_sec` |
/// | `FAILSAFE_TIMEOUT_SEC` | `timeout_sec` |
/// | `FAILSAFE_LOOP_HZ` | `loop_hz` |
/// | `FAILSAFE_SIMULATE` | `simulate` |
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("FAILSAFE_BOND_IDS") {
        let ids: Vec<String> = v
            .split(',')
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(String::from)
            .collect();
        if !ids.is_empty() {
            cfg.bond_ids = ids;
        }
    }
    if let Ok(v) = std::env::var("FAILSAFE_HEARTBEAT_SEC")
        && let Ok(secs) = v.trim().parse::<f64>()
    {
        cfg.heartbeat_sec = secs;
    }
    if let Ok(v) = std::env::var("FAILSAFE_TIMEOUT_SEC")
        && let Ok(secs) = v.trim().parse::<f64>()
    {
        cfg.timeout_sec = secs;
    }
    if let Ok(v) = std::env::var("FAILSAFE_LOOP_HZ")
        && let Ok(hz) = v.trim().parse::<f64>()
    {
        cfg.loop_hz = Some(hz);
    }
    if let Ok(v) = std::env::var("FAILSAFE_SIMULATE")
        && let Some(flag) = parse_flag(&v)
    {
        cfg.simulate = flag;
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use failsafe_runtime::FaultKind;

    fn write(dir: &tempfile::TempDir, body: &str) -> PathBuf {
        let path = dir.path().join(DEFAULT_CONFIG_FILE);
        fs::write(&path, body).expect("write config");
        path
    }

    #[test]
    fn defaults_match_reference_timing() {
        let cfg = Config::default();
        assert_eq!(cfg.heartbeat_sec, 0.2);
        assert_eq!(cfg.timeout_sec, 0.5);
        assert_eq!(cfg.connect_timeout_sec, 10.0);
        assert_eq!(cfg.session, "bond_topic");
        assert_eq!(cfg.topic_capacity, 100);
        assert!(!cfg.simulate);
    }

    #[test]
    fn load_from_returns_none_when_missing() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let result = load_from(&dir.path().join("absent.toml")).expect("no error");
        assert!(result.is_none());
    }

    #[test]
    fn minimal_file_fills_in_defaults() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = write(&dir, r#"bond_ids = ["planner", "controller", "fallback"]"#);

        let cfg = load_from(&path).expect("load ok").expect("some");
        assert_eq!(cfg.bond_ids, ["planner", "controller", "fallback"]);
        assert_eq!(cfg.heartbeat_sec, 0.2);
        assert_eq!(cfg.loop_hz, None);
    }

    #[test]
    fn roundtrip_through_toml() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let cfg = Config {
            bond_ids: vec!["A".into(), "B".into()],
            loop_hz: Some(20.0),
            simulate: true,
            faults: vec![SimulatedFault {
                node: "B".into(),
                after_sec: 2.5,
                kind: FaultKind::Crash,
            }],
            ..Config::default()
        };
        let path = write(&dir, &toml::to_string_pretty(&cfg).expect("serialize"));

        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn fault_plan_parses_from_array_of_tables() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = write(
            &dir,
            r#"
bond_ids = ["A", "B"]
simulate = true

[[faults]]
node = "B"
after_sec = 1.0
kind = "degraded"

[[faults]]
node = "A"
after_sec = 3.0
kind = "exit"
"#,
        );

        let cfg = load_from(&path).expect("load ok").expect("some");
        assert_eq!(cfg.faults.len(), 2);
        assert_eq!(cfg.faults[0].kind, FaultKind::Degraded);
        assert_eq!(cfg.faults[1].kind, FaultKind::Exit);
    }

    #[test]
    fn malformed_file_is_a_config_error() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = write(&dir, "bond_ids = [");
        assert!(matches!(load_from(&path), Err(FailsafeError::Config(_))));
    }

    #[test]
    fn path_prefers_argument_then_env_then_default() {
        assert_eq!(
            resolve_path(Some("cli.toml".into()), Some("env.toml".into())),
            PathBuf::from("cli.toml")
        );
        assert_eq!(resolve_path(None, Some("env.toml".into())), PathBuf::from("env.toml"));
        assert_eq!(resolve_path(None, None), PathBuf::from(DEFAULT_CONFIG_FILE));
    }

    #[test]
    fn supervisor_config_uses_three_ticks_per_heartbeat() {
        let cfg = Config {
            bond_ids: vec!["A".into()],
            ..Config::default()
        };
        let sc = cfg.to_supervisor_config().expect("valid");
        assert_eq!(sc.timing.heartbeat_period, Duration::from_millis(200));
        assert_eq!(sc.timing.heartbeat_timeout, Duration::from_millis(500));
        assert_eq!(sc.timing.connect_timeout, Duration::from_secs(10));
        assert_eq!(sc.loop_period, Duration::from_millis(200) / 3);
    }

    #[test]
    fn supervisor_config_honours_loop_hz() {
        let cfg = Config {
            bond_ids: vec!["A".into()],
            loop_hz: Some(20.0),
            ..Config::default()
        };
        let sc = cfg.to_supervisor_config().expect("valid");
        assert!((sc.loop_period.as_secs_f64() - 0.05).abs() < 1e-9);
    }

    #[test]
    fn supervisor_config_rejects_bad_values() {
        let base = Config {
            bond_ids: vec!["A".into()],
            ..Config::default()
        };
        let slow_loop = Config {
            loop_hz: Some(5.0),
            ..base.clone()
        };
        let zero_loop = Config {
            loop_hz: Some(0.0),
            ..base.clone()
        };
        let negative_heartbeat = Config {
            heartbeat_sec: -0.2,
            ..base.clone()
        };
        let timeout_below_heartbeat = Config {
            timeout_sec: 0.1,
            ..base.clone()
        };
        let no_ladder = Config::default();

        for cfg in [slow_loop, zero_loop, negative_heartbeat, timeout_below_heartbeat, no_ladder] {
            assert!(
                matches!(cfg.to_supervisor_config(), Err(FailsafeError::Config(_))),
                "{cfg:?} must be rejected"
            );
        }
    }

    #[test]
    fn apply_env_overrides_changes_bond_ids() {
        // SAFETY: no other test in this crate touches this variable.
        unsafe { std::env::set_var("FAILSAFE_BOND_IDS", "planner, controller ,,fallback") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.bond_ids, ["planner", "controller", "fallback"]);
        unsafe { std::env::remove_var("FAILSAFE_BOND_IDS") };
    }

    #[test]
    fn apply_env_overrides_changes_heartbeat() {
        // SAFETY: no other test in this crate touches this variable.
        unsafe { std::env::set_var("FAILSAFE_HEARTBEAT_SEC", "0.1") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.heartbeat_sec, 0.1);
        unsafe { std::env::remove_var("FAILSAFE_HEARTBEAT_SEC") };
    }

    #[test]
    fn apply_env_overrides_changes_timeout_and_loop_rate() {
        // SAFETY: no other test in this crate touches these variables.
        unsafe {
            std::env::set_var("FAILSAFE_TIMEOUT_SEC", "0.8");
            std::env::set_var("FAILSAFE_LOOP_HZ", "30");
        }
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.timeout_sec, 0.8);
        assert_eq!(cfg.loop_hz, Some(30.0));
        unsafe {
            std::env::remove_var("FAILSAFE_TIMEOUT_SEC");
            std::env::remove_var("FAILSAFE_LOOP_HZ");
        }
    }

    #[test]
    fn apply_env_overrides_ignores_unparsable_flag() {
        // SAFETY: no other test in this crate touches this variable.
        unsafe { std::env::set_var("FAILSAFE_SIMULATE", "maybe") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert!(!cfg.simulate);

        unsafe { std::env::set_var("FAILSAFE_SIMULATE", "yes") };
        apply_env_overrides(&mut cfg);
        assert!(cfg.simulate);
        unsafe { std::env::remove_var("FAILSAFE_SIMULATE") };
    }
}
