//! Session lifecycle states and the legal transitions between them.
//!
//! The table is a pure function so it can be tested in isolation; the
//! side effects of entering a state live on [`Session`](super::Session).
//!
//! ## State Transitions
//!
//! ```text
//! Allocated -> Created -> Configured -> IdentifyingUser -> UserIdentified
//!      |          |           |               |                 |
//!      +----------+-----------+---------------+-----------------+--> Expiring
//!
//! Expiring -> Created / Configured / IdentifyingUser / UserIdentified  (resume)
//! Expiring -> Expiring                                  (re-enter, clock kept)
//! Expiring -> Expired                                   (grace period lapse)
//! ```
//!
//! `Invalid` is reachable from every state when an invariant is violated
//! during a transition; `Invalid` and `Expired` are terminal.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// An invariant was violated; the session is dead and will be replaced.
    Invalid,
    Allocated,
    Created,
    Configured,
    IdentifyingUser,
    UserIdentified,
    /// Backgrounded and counting down the grace period.
    Expiring,
    Expired,
}

/// Every state, in lifecycle order. Useful for exhaustive checks.
pub const ALL_STATES: [SessionState; 8] = [
    SessionState::Invalid,
    SessionState::Allocated,
    SessionState::Created,
    SessionState::Configured,
    SessionState::IdentifyingUser,
    SessionState::UserIdentified,
    SessionState::Expiring,
    SessionState::Expired,
];

impl SessionState {
    pub fn name(self) -> &'static str {
        match self {
            SessionState::Invalid => "invalid",
            SessionState::Allocated => "allocated",
            SessionState::Created => "created",
            SessionState::Configured => "configured",
            SessionState::IdentifyingUser => "identifying_user",
            SessionState::UserIdentified => "user_identified",
            SessionState::Expiring => "expiring",
            SessionState::Expired => "expired",
        }
    }

    /// States this state may legally move to. `Invalid` is not listed:
    /// it is always reachable as the failure target.
    pub fn allowed_transitions(self) -> &'static [SessionState] {
        match self {
            SessionState::Invalid => &[],
            SessionState::Allocated => &[SessionState::Created, SessionState::Expiring],
            SessionState::Created => &[SessionState::Configured, SessionState::Expiring],
            SessionState::Configured => {
                &[SessionState::IdentifyingUser, SessionState::Expiring]
            }
            SessionState::IdentifyingUser => {
                &[SessionState::UserIdentified, SessionState::Expiring]
            }
            SessionState::UserIdentified => &[SessionState::Expiring],
            SessionState::Expiring => &[
                SessionState::Expiring,
                SessionState::Created,
                SessionState::Configured,
                SessionState::IdentifyingUser,
                SessionState::UserIdentified,
                SessionState::Expired,
            ],
            SessionState::Expired => &[],
        }
    }

    pub fn can_transition_to(self, next: SessionState) -> bool {
        if next == SessionState::Invalid {
            return true;
        }
        self.allowed_transitions().contains(&next)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Invalid | SessionState::Expired)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
