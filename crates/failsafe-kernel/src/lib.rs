//! `failsafe-kernel` – Safety Supervision
//!
//! Decides, every control cycle, which level of the control hierarchy is still
//! trustworthy.  It does not drive anything; it watches and collapses
//! authority.
//!
//! # Modules
//!
//! - [`watcher`] – [`BondWatcher`][watcher::BondWatcher]: one watched node,
//!   combining its heartbeat bond with the safety topic into a monotone
//!   `safety_active` / `fatal_active` flag pair.
//! - [`ladder`] – [`PriorityLadder`][ladder::PriorityLadder]: the fixed,
//!   authority-ordered list of watchers, plus the pure priority fold and its
//!   range check.
//! - [`decision`] – [`Decision`][decision::Decision]: what a folded priority
//!   means (nominal, restrict to one node, or FATAL).
//! - [`supervisor`] – [`SafetySupervisor`][supervisor::SafetySupervisor]:
//!   forms the bonds at startup and runs the fold-and-publish loop.

pub mod decision;
pub mod ladder;
pub mod supervisor;
pub mod watcher;

pub use decision::Decision;
pub use ladder::{FATAL_PRIORITY, PriorityLadder, check_priority_range, fold_lowest_safe_priority};
pub use supervisor::{DEFAULT_SESSION, SafetySupervisor, SupervisorConfig};
pub use watcher::{BondWatcher, LadderMember, WatcherStatus};
