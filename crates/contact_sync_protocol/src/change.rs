//! Pending change markers.

use serde::{Deserialize, Serialize};

/// Local change state of one account relative to the remote store.
///
/// `Unchanged` is what an absent entry means; pending change sets never
/// store it explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ChangeState {
    /// Nothing to push.
    #[default]
    Unchanged,
    /// The account's record must be rebuilt and pushed.
    Updated,
    /// The account's record must be removed remotely.
    Deleted,
}

impl ChangeState {
    /// Converts to the persisted code.
    #[must_use]
    pub fn to_code(self) -> u8 {
        match self {
            ChangeState::Unchanged => 0,
            ChangeState::Updated => 1,
            ChangeState::Deleted => 2,
        }
    }

    /// Converts from a persisted code.
    #[must_use]
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(ChangeState::Unchanged),
            1 => Some(ChangeState::Updated),
            2 => Some(ChangeState::Deleted),
            _ => None,
        }
    }

    /// Returns true for states that require remote work.
    #[must_use]
    pub fn is_pending(self) -> bool {
        !matches!(self, ChangeState::Unchanged)
    }
}
