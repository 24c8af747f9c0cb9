//! `failsafe-runtime` – Process Wiring
//!
//! Everything a failsafe process needs around the kernel: logging, the
//! startup-and-run sequence, and a simulated fleet of watched nodes.
//!
//! # Modules
//!
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]:
//!   initialises the global `tracing` subscriber with an optional OTLP span
//!   exporter.  Set `OTEL_EXPORTER_OTLP_ENDPOINT` to enable live trace export
//!   to Jaeger, Grafana Tempo, or any OTLP-compatible collector.
//! - [`safety_node`] – [`run_safety_node`][safety_node::run_safety_node]:
//!   forms the bonds, runs the supervisor loop until shutdown, and reports how
//!   the run ended.
//! - [`sim`] – [`SimulatedNode`][sim::SimulatedNode] and
//!   [`SimulatedFleet`][sim::SimulatedFleet]: node-side bond endpoints that
//!   react to supervisor commands, plus a scripted fault plan.

pub mod safety_node;
pub mod sim;
pub mod telemetry;

pub use safety_node::{RunSummary, run_safety_node};
pub use sim::{FaultKind, Reaction, SimulatedFault, SimulatedFleet, SimulatedNode};
pub use telemetry::{TracerProviderGuard, init_tracing};
