use std::fmt;

/// Lifecycle of one `Coordinator::commit` call.
///
/// ```text
/// Created -> Locked -> ForwardRunning -> AllSucceeded -> Committed
///                                     \-> AnyFailed -> CompensationRunning -> Compensated
/// Created -> LockFailed
/// (any)   -> FatalError
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[non_exhaustive]
pub enum CoordinatorState {
    #[default]
    Created,
    Locked,
    ForwardRunning,
    AllSucceeded,
    Committed,
    AnyFailed,
    CompensationRunning,
    Compensated,
    LockFailed,
    FatalError,
}

impl CoordinatorState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Committed | Self::Compensated | Self::LockFailed | Self::FatalError
        )
    }
}

impl fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Locked => "locked",
            Self::ForwardRunning => "forward_running",
            Self::AllSucceeded => "all_succeeded",
            Self::Committed => "committed",
            Self::AnyFailed => "any_failed",
            Self::CompensationRunning => "compensation_running",
            Self::Compensated => "compensated",
            Self::LockFailed => "lock_failed",
            Self::FatalError => "fatal_error",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_end_states_are_terminal() {
        assert!(CoordinatorState::Committed.is_terminal());
        assert!(CoordinatorState::Compensated.is_terminal());
        assert!(CoordinatorState::LockFailed.is_terminal());
        assert!(CoordinatorState::FatalError.is_terminal());
        assert!(!CoordinatorState::ForwardRunning.is_terminal());
        assert!(!CoordinatorState::CompensationRunning.is_terminal());
    }
}
