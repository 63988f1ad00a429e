//! Per-worker phase, derived from the DESIRED and APPLIED documents.

use std::fmt;

use fleet_core::{Target, UserCommand};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// No DESIRED document: nothing to do.
    Absent,
    /// DESIRED differs from APPLIED, or nothing has been applied yet.
    PendingApply,
    /// APPLIED mirrors DESIRED.
    Converged,
    /// DESIRED asks for removal.
    PendingRemove,
}

impl Phase {
    pub fn derive(desired: Option<&Target>, applied: Option<&Target>) -> Self {
        let Some(desired) = desired else {
            return Phase::Absent;
        };
        if desired.user_cmd == UserCommand::Remove {
            return Phase::PendingRemove;
        }
        match applied {
            Some(applied) if applied.mirrors(desired) => Phase::Converged,
            _ => Phase::PendingApply,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Absent => "absent",
            Phase::PendingApply => "pending_apply",
            Phase::Converged => "converged",
            Phase::PendingRemove => "pending_remove",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
