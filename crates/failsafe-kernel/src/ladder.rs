//! [`PriorityLadder`] and the priority fold.
//!
//! The ladder orders watched nodes by descending control authority: index 0 is
//! the primary controller, index `N-1` the last-resort fallback.  Each tick the
//! supervisor folds every member's flag pair into the lowest priority that is
//! still safe:
//!
//! - `safety_active(i)`: levels `0..i` can no longer be trusted → `min(i, p)`
//! - `fatal_active(i)`: level `i` itself is untrustworthy → `min(i - 1, p)`
//!
//! The fold is a plain minimum, so it is idempotent and independent of the
//! order in which members are visited.  The result must stay within
//! `[-1, N-1]`; [`check_priority_range`] rejects anything else.

use failsafe_types::{FailsafeError, NodeIdentity};

use crate::watcher::{BondWatcher, LadderMember, WatcherStatus};

/// Priority that means "no level is safe".
pub const FATAL_PRIORITY: i32 = -1;

/// Fixed, ordered set of ladder members.  Never empty, never reordered.
pub struct PriorityLadder<M = BondWatcher> {
    members: Vec<M>,
}

impl<M: LadderMember> PriorityLadder<M> {
    /// Build a ladder from members in descending authority order.
    ///
    /// # Errors
    ///
    /// [`FailsafeError::Config`] when `members` is empty.
    pub fn new(members: Vec<M>) -> Result<Self, FailsafeError> {
        if members.is_empty() {
            return Err(FailsafeError::Config("priority ladder must not be empty".into()));
        }
        Ok(Self { members })
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Always `false`; provided for API symmetry with [`len`][Self::len].
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// The priority of a fully nominal ladder, `N-1`.
    pub fn nominal_priority(&self) -> i32 {
        as_priority(self.members.len()) - 1
    }

    pub fn get(&self, index: usize) -> Option<&M> {
        self.members.get(index)
    }

    /// Identity of the member at `priority`, if `priority` names a member.
    pub fn identity(&self, priority: i32) -> Option<&NodeIdentity> {
        usize::try_from(priority)
            .ok()
            .and_then(|i| self.members.get(i))
            .map(|member| member.identity())
    }

    /// Members in ascending index (descending authority) order.
    pub fn iter(&self) -> impl Iterator<Item = &M> {
        self.members.iter()
    }

    /// Every member's flag pair, paired with its index.
    pub fn statuses(&self) -> Vec<(usize, WatcherStatus)> {
        self.members
            .iter()
            .enumerate()
            .map(|(i, member)| (i, member.status()))
            .collect()
    }
}

/// Fold member statuses into `current`, returning the new lowest safe
/// priority.  Never raises `current`.
pub fn fold_lowest_safe_priority<I>(current: i32, statuses: I) -> i32
where
    I: IntoIterator<Item = (usize, WatcherStatus)>,
{
    statuses
        .into_iter()
        .fold(current, |lowest, (index, status)| {
            let index = as_priority(index);
            let mut lowest = lowest;
            if status.safety_active {
                lowest = lowest.min(index);
            }
            if status.fatal_active {
                lowest = lowest.min(index - 1);
            }
            lowest
        })
}

/// Verify `value` lies in `[-1, ladder_len - 1]`.
///
/// # Errors
///
/// [`FailsafeError::InvariantViolation`] otherwise.  The value is never
/// clamped: an out-of-range result means the fold itself is wrong.
pub fn check_priority_range(value: i32, ladder_len: usize) -> Result<i32, FailsafeError> {
    let highest = as_priority(ladder_len) - 1;
    if (FATAL_PRIORITY..=highest).contains(&value) {
        Ok(value)
    } else {
        Err(FailsafeError::InvariantViolation { value, ladder_len })
    }
}

fn as_priority(index: usize) -> i32 {
    i32::try_from(index).unwrap_or(i32::MAX)
}
