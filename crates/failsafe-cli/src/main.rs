//! `failsafe-cli` – Failsafe Command Line Interface
//!
//! This binary runs the safety supervisor as a process.  It:
//!
//! 1. Installs logging (see `failsafe_runtime::telemetry`).
//! 2. Loads `failsafe.toml` (path from the first argument or
//!    `FAILSAFE_CONFIG`) and applies `FAILSAFE_*` overrides.
//! 3. Optionally spawns a simulated node per ladder identity and replays the
//!    configured fault plan against them.
//! 4. Runs the supervisor until **Ctrl-C** or SIGTERM.
//!
//! Exit code 0 on shutdown, 1 on a configuration error or a broken priority
//! invariant.

mod config;

use std::process::ExitCode;
use std::sync::Arc;

use colored::Colorize;
use failsafe_kernel::SupervisorConfig;
use failsafe_middleware::{HeartbeatBus, HeartbeatChannel, SafetyBus};
use failsafe_runtime::{RunSummary, SimulatedFleet, run_safety_node};
use failsafe_types::FailsafeError;
use tokio::sync::watch;
use tracing::{error, info, warn};

fn main() -> ExitCode {
    let _telemetry = failsafe_runtime::init_tracing("failsafe");

    print_banner();

    let path = config::config_path(std::env::args().nth(1));
    let cfg = match config::load(&path) {
        Ok(cfg) => cfg,
        Err(e) => return fail(&e),
    };
    if path.exists() {
        println!("  Config loaded from {}", path.display().to_string().bold());
    } else {
        println!(
            "  {} not found; using defaults and environment overrides.",
            path.display().to_string().bold()
        );
    }
    let supervisor_config = match cfg.to_supervisor_config() {
        Ok(sc) => sc,
        Err(e) => return fail(&e),
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => return fail(&FailsafeError::Config(format!("failed to start runtime: {e}"))),
    };

    // ── Ctrl-C / SIGTERM handler ──────────────────────────────────────────
    let (stop, shutdown) = watch::channel(false);
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Shutdown requested – letting every bond lapse …".yellow().bold());
        let _ = stop.send(true);
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; graceful shutdown on Ctrl-C will not be available");
    }

    match runtime.block_on(run(&cfg, &supervisor_config, shutdown)) {
        Ok(summary) => {
            print_summary(&summary);
            ExitCode::SUCCESS
        }
        Err(e) => fail(&e),
    }
}

async fn run(
    cfg: &config::Config,
    supervisor_config: &SupervisorConfig,
    shutdown: watch::Receiver<bool>,
) -> Result<RunSummary, FailsafeError> {
    let channel: Arc<dyn HeartbeatChannel> = Arc::new(HeartbeatBus::default());
    let bus = SafetyBus::new(supervisor_config.topic_capacity);

    let mut fleet = if cfg.simulate {
        info!(nodes = supervisor_config.bond_ids.len(), "spawning simulated nodes");
        Some(SimulatedFleet::spawn(supervisor_config, Arc::clone(&channel), bus.clone())?)
    } else {
        warn!("simulation disabled; bonds only form with peers on the heartbeat channel");
        None
    };

    let plan = async {
        match fleet.as_mut() {
            Some(fleet) if !cfg.faults.is_empty() => {
                if let Err(e) = fleet.run_plan(&cfg.faults, shutdown.clone()).await {
                    error!(error = %e, "fault plan aborted");
                }
            }
            _ => {}
        }
    };

    let (summary, ()) = tokio::join!(
        run_safety_node(supervisor_config, channel, bus, shutdown.clone()),
        plan
    );
    summary
}

fn fail(e: &FailsafeError) -> ExitCode {
    error!(error = %e, "failsafe stopped");
    eprintln!("{}: {}", "Error".red().bold(), e);
    ExitCode::from(1)
}

// ─────────────────────────────────────────────────────────────────────────────
// Output
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"   ____     _ __            ___    "#.bold().cyan());
    println!("{}", r#"  / __/__ _(_) /__ ___ ____/ _/__ "#.bold().cyan());
    println!("{}", r#" / _// _ `/ / (_-</ _ `/ _/ / -_)"#.bold().cyan());
    println!("{}", r#"/_/  \_,_/_/_/___/\_,_/_//_/\__/ "#.bold().cyan());
    println!();
    println!("  {} {}",
        "Failsafe".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Heartbeat Safety Supervisor");
    println!();
}

fn print_summary(summary: &RunSummary) {
    let state = if summary.lowest_safe_priority < 0 {
        "FATAL".red().bold()
    } else {
        summary.lowest_safe_priority.to_string().green().bold()
    };
    println!("  Lowest safe priority at shutdown: {state}");
    if let Some(failed) = &summary.startup_failure {
        println!("  {} bond {} never formed", "✗".red().bold(), failed.as_str().bold());
    }
    println!("  {} {} bond(s) released.", "✓".green(), summary.members);
}
