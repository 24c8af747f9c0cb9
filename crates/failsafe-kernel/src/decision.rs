//! [`Decision`] – what a tick's lowest safe priority means for the fleet.

use failsafe_types::{Directive, FailsafeError, NodeIdentity};

use crate::ladder::{FATAL_PRIORITY, PriorityLadder, check_priority_range};
use crate::watcher::LadderMember;

/// Outcome of one supervisor tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Every level is trusted; nothing is published.
    Nominal,
    /// Levels above `priority` are untrusted; `identity` should take or keep
    /// control.
    Restrict {
        priority: usize,
        identity: NodeIdentity,
    },
    /// No level is safe; every receiver must stop.
    Fatal,
}

impl Decision {
    /// Interpret `priority` against `ladder`.
    ///
    /// # Errors
    ///
    /// [`FailsafeError::InvariantViolation`] when `priority` is outside
    /// `[-1, N-1]`.
    pub fn from_priority<M: LadderMember>(
        priority: i32,
        ladder: &PriorityLadder<M>,
    ) -> Result<Self, FailsafeError> {
        let priority = check_priority_range(priority, ladder.len())?;
        if priority == FATAL_PRIORITY {
            return Ok(Self::Fatal);
        }
        if priority == ladder.nominal_priority() {
            return Ok(Self::Nominal);
        }
        match ladder.identity(priority) {
            Some(identity) => Ok(Self::Restrict {
                priority: priority as usize,
                identity: identity.clone(),
            }),
            None => Err(FailsafeError::InvariantViolation {
                value: priority,
                ladder_len: ladder.len(),
            }),
        }
    }

    /// The directive to publish, or `None` in the nominal case.
    pub fn directive(&self) -> Option<Directive> {
        match self {
            Self::Nominal => None,
            Self::Restrict { identity, .. } => Some(Directive::Node(identity.clone())),
            Self::Fatal => Some(Directive::Fatal),
        }
    }
}
