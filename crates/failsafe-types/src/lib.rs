use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Reserved payload that tells every listener to stop, regardless of its
/// position on the ladder.
pub const FATAL_PAYLOAD: &str = "FATAL";

/// Unique name of a watched control process (e.g. `"planner"`).
///
/// Construct through [`NodeIdentity::new`], which rejects empty names and the
/// reserved [`FATAL_PAYLOAD`] literal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeIdentity(String);

impl NodeIdentity {
    pub fn new(id: impl Into<String>) -> Result<Self, FailsafeError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(FailsafeError::Config("node identity must not be empty".into()));
        }
        if id == FATAL_PAYLOAD {
            return Err(FailsafeError::Config(format!(
                "node identity {FATAL_PAYLOAD:?} is reserved"
            )));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for NodeIdentity {
    type Error = FailsafeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<NodeIdentity> for String {
    fn from(id: NodeIdentity) -> Self {
        id.0
    }
}

/// What a safety message points at: one ladder member, or everyone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "node")]
pub enum Directive {
    /// "This node should take (or keep) authority."
    Node(NodeIdentity),
    /// Unconditional stop for every receiver.
    Fatal,
}

impl Directive {
    /// Parse a raw string payload as carried by string-only transports.
    pub fn from_payload(payload: &str) -> Result<Self, FailsafeError> {
        if payload == FATAL_PAYLOAD {
            Ok(Self::Fatal)
        } else {
            NodeIdentity::new(payload).map(Self::Node)
        }
    }

    /// The raw string payload: the node identity or `"FATAL"`.
    pub fn payload(&self) -> &str {
        match self {
            Self::Node(id) => id.as_str(),
            Self::Fatal => FATAL_PAYLOAD,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal)
    }
}

impl fmt::Display for Directive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.payload())
    }
}

/// The two logical message kinds sharing the safety topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "directive")]
pub enum SafetyMessage {
    /// Published by the supervisor after a restricting tick.
    Command(Directive),
    /// Published by a watched node about itself.
    SelfReport(Directive),
}

impl SafetyMessage {
    pub fn directive(&self) -> &Directive {
        match self {
            Self::Command(d) | Self::SelfReport(d) => d,
        }
    }
}

/// Envelope routed over the safety bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// e.g. `"failsafe-kernel::supervisor"`
    pub source: String,
    pub message: SafetyMessage,
}

impl SafetyEvent {
    pub fn new(source: impl Into<String>, message: SafetyMessage) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
            message,
        }
    }
}

/// Lifecycle of a bond. `Broken` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkState {
    /// Heartbeating, waiting for the first frame from the peer.
    Pending,
    /// The peer is answering within its deadline.
    Formed,
    /// Handshake timed out, the peer went silent, or the peer severed the bond.
    Broken,
}

impl LinkState {
    pub fn is_settled(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// One status frame exchanged on a heartbeat session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Session name shared by both ends of the bond.
    pub session: String,
    pub id: NodeIdentity,
    /// Random per-link instance, so a link can tell its own frames from its
    /// peer's and notice a restarted peer.
    pub instance: Uuid,
    /// `false` on the farewell frame of a deliberately severed bond.
    pub active: bool,
    pub sent_at: DateTime<Utc>,
}

/// Errors raised across the failsafe workspace.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailsafeError {
    #[error("Bond {identity} never formed during startup")]
    StartupBondFailure { identity: String },

    #[error("Bond {identity} broke")]
    LinkBroken { identity: String },

    #[error("Lowest safe priority {value} outside the legal range for a ladder of {ladder_len}")]
    InvariantViolation { value: i32, ladder_len: usize },

    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("Channel Error: {0}")]
    Channel(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_rejects_reserved_and_empty_names() {
        assert!(NodeIdentity::new("planner").is_ok());
        assert!(matches!(NodeIdentity::new("FATAL"), Err(FailsafeError::Config(_))));
        assert!(matches!(NodeIdentity::new("  "), Err(FailsafeError::Config(_))));
    }

    #[test]
    fn directive_payload_parsing() {
        assert_eq!(Directive::from_payload("FATAL").unwrap(), Directive::Fatal);
        let node = Directive::from_payload("controller").unwrap();
        assert_eq!(node.payload(), "controller");
        assert!(!node.is_fatal());
        assert!(Directive::from_payload("").is_err());
    }

    #[test]
    fn both_message_kinds_expose_their_directive() {
        let id = NodeIdentity::new("fallback").unwrap();
        let cmd = SafetyMessage::Command(Directive::Node(id.clone()));
        let report = SafetyMessage::SelfReport(Directive::Node(id));
        assert_eq!(cmd.directive(), report.directive());
        assert_ne!(cmd, report);
    }

    #[test]
    fn safety_event_serializes_tagged_message() {
        let event = SafetyEvent::new(
            "failsafe-kernel::supervisor",
            SafetyMessage::Command(Directive::Fatal),
        );
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"Command\""));
        let back: SafetyEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, event.id);
        assert_eq!(back.message, event.message);
    }

    #[test]
    fn reserved_identity_is_rejected_on_deserialize() {
        let result: Result<NodeIdentity, _> = serde_json::from_str("\"FATAL\"");
        assert!(result.is_err());
    }

    #[test]
    fn link_state_settled() {
        assert!(!LinkState::Pending.is_settled());
        assert!(LinkState::Formed.is_settled());
        assert!(LinkState::Broken.is_settled());
    }

    #[test]
    fn invariant_violation_display_names_the_range() {
        let err = FailsafeError::InvariantViolation { value: -2, ladder_len: 3 };
        let text = err.to_string();
        assert!(text.contains("-2"));
        assert!(text.contains("ladder of 3"));
    }
}
