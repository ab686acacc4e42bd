//! Worker lifecycle states for the scheduling engine.
//!
//! The engine exposes start/stop/pause/resume hooks an external worker
//! host can drive; these states are what it reports back to observers.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a [`Scheduler`](crate::engine::Scheduler).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Not running; no wake-up armed, retry queue empty.
    Stopped,
    /// Transitioning into Running (initial scan in progress).
    Starting,
    /// Actively scanning and firing.
    Running,
    /// Transitioning into Paused.
    Pausing,
    /// Suspended; the retry queue is preserved for resume.
    Paused,
    /// Transitioning from Paused back to Running.
    Resuming,
    /// Transitioning into Stopped; pending retries are discarded.
    Stopping,
}

impl WorkerState {
    pub fn is_running(&self) -> bool {
        matches!(self, WorkerState::Running)
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkerState::Stopped => "stopped",
            WorkerState::Starting => "starting",
            WorkerState::Running => "running",
            WorkerState::Pausing => "pausing",
            WorkerState::Paused => "paused",
            WorkerState::Resuming => "resuming",
            WorkerState::Stopping => "stopping",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_matches_serde_casing() {
        let json = serde_json::to_string(&WorkerState::Pausing).unwrap();
        assert_eq!(json, "\"pausing\"");
        assert_eq!(WorkerState::Pausing.to_string(), "pausing");
    }

    #[test]
    fn only_running_reports_running() {
        assert!(WorkerState::Running.is_running());
        assert!(!WorkerState::Resuming.is_running());
        assert!(!WorkerState::Stopped.is_running());
    }
}
