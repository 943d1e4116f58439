//! Worker lifecycle state machine.

use serde::{Deserialize, Serialize};

/// Lifecycle of one worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Connecting to the store.
    Starting,
    /// Claiming and executing tasks.
    Running,
    /// Stop requested; finishing in-flight executions, no new claims.
    Draining,
    /// Done. Terminal.
    Stopped,
}

impl WorkerState {
    pub fn can_transition_to(&self, target: WorkerState) -> bool {
        use WorkerState::*;

        matches!(
            (self, target),
            (Starting, Running) | (Starting, Stopped) |
            (Running, Draining) |
            (Draining, Stopped)
        )
    }

    /// Whether new claims are allowed.
    pub fn accepts_work(&self) -> bool {
        matches!(self, Self::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_transitions() {
        use WorkerState::*;

        assert!(Starting.can_transition_to(Running));
        assert!(Running.can_transition_to(Draining));
        assert!(Draining.can_transition_to(Stopped));
        // Failed startup never enters running.
        assert!(Starting.can_transition_to(Stopped));

        assert!(!Running.can_transition_to(Stopped));
        assert!(!Draining.can_transition_to(Running));
        assert!(!Stopped.can_transition_to(Starting));
    }

    #[test]
    fn test_only_running_accepts_work() {
        assert!(WorkerState::Running.accepts_work());
        assert!(!WorkerState::Draining.accepts_work());
        assert!(!WorkerState::Starting.accepts_work());
        assert!(!WorkerState::Stopped.accepts_work());
    }
}
