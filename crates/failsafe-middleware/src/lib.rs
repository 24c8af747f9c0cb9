//! `failsafe-middleware` – Transports
//!
//! Moves safety traffic and heartbeats between the supervisor and the watched
//! nodes without caring what the messages mean.
//!
//! # Modules
//!
//! - [`bus`] – [`SafetyBus`]: the single shared safety topic, built on a Tokio
//!   broadcast channel, carrying supervisor commands and node self-reports.
//! - [`heartbeat`] – [`HeartbeatChannel`]: the seam behind which heartbeat
//!   transports live, plus the in-process [`HeartbeatBus`].
//! - [`bond`] – [`LivenessLink`]: one end of a heartbeat bond with the
//!   `Pending → Formed → Broken` state machine.

pub mod bond;
pub mod bus;
pub mod heartbeat;

pub use bond::{LinkTiming, LivenessLink};
pub use bus::{Delivery, SafetyBus, SafetyReceiver};
pub use heartbeat::{HeartbeatBus, HeartbeatChannel};
