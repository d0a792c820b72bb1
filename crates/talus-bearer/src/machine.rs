//! Hierarchical state ids for the bearer state machine.
//!
//! The machine is two levels deep: five concrete states share a single
//! `Default` parent that handles events common to all of them. Dispatch
//! walks the parent chain upward when a state does not handle an event;
//! there is no inheritance, just this table.
//!
//! ```text
//!                 ┌────────── Default ──────────┐
//!                 │                             │
//!   Inactive ──▶ Activating ──▶ Active ──▶ Disconnecting ──▶ Inactive
//!                     │
//!                     └──▶ DisconnectingSetupError ──▶ Inactive
//! ```

/// Identity of a state in the bearer machine.
///
/// `Default` is never the current state of a bearer; it only exists as the
/// parent that concrete states fall back to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateId {
    Default,
    Inactive,
    Activating,
    Active,
    Disconnecting,
    /// Tearing down a call whose setup response was unusable.
    DisconnectingSetupError,
}

impl StateId {
    /// Parent in the state hierarchy; `None` for the root.
    pub fn parent(self) -> Option<StateId> {
        match self {
            StateId::Default => None,
            StateId::Inactive
            | StateId::Activating
            | StateId::Active
            | StateId::Disconnecting
            | StateId::DisconnectingSetupError => Some(StateId::Default),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StateId::Default => "default",
            StateId::Inactive => "inactive",
            StateId::Activating => "activating",
            StateId::Active => "active",
            StateId::Disconnecting => "disconnecting",
            StateId::DisconnectingSetupError => "disconnecting_setup_error",
        }
    }

    /// Whether the state is waiting on a deactivate reply.
    pub fn is_disconnecting(&self) -> bool {
        matches!(
            self,
            StateId::Disconnecting | StateId::DisconnectingSetupError
        )
    }
}
