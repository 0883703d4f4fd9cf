//! Session lifecycle states.

use std::fmt;

/// Lifecycle state shared by client and server sessions.
///
/// A client moves `Init -> Running -> Stopped -> Running -> ...`, where
/// `Stopped` means disconnected with a retry scheduled. A server moves
/// `Init -> Running -> Stopped` and may be started again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SessionState {
    #[default]
    Init,
    Running,
    Stopped,
}

impl SessionState {
    pub fn is_running(&self) -> bool {
        matches!(self, SessionState::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Init => "INIT",
            SessionState::Running => "RUNNING",
            SessionState::Stopped => "STOPPED",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
