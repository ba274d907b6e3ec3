//! Core records: tests, test runs, and the derived run state machine.

use serde::{Deserialize, Serialize};

/// Sentinel for an unset timestamp field (epoch millis).
pub const UNSET: i64 = -1;

/// Current wall-clock time in epoch milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Lifecycle state of a test run, derived from its four timestamp fields.
///
/// Transitions are strictly ordered:
/// `NOT_SCHEDULED -> SCHEDULED -> STARTED -> {COMPLETED | STOPPED}`.
/// `COMPLETED` and `STOPPED` are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    NotScheduled,
    Scheduled,
    Started,
    Completed,
    Stopped,
}

impl RunState {
    /// Derive the state from the stored timestamp fields. Exactly one state
    /// holds for any field combination the store can contain.
    pub fn derive(scheduled: i64, started: i64, stopped: i64, completed: i64) -> RunState {
        if completed != UNSET {
            RunState::Completed
        } else if stopped != UNSET {
            RunState::Stopped
        } else if started != UNSET {
            RunState::Started
        } else if scheduled != UNSET {
            RunState::Scheduled
        } else {
            RunState::NotScheduled
        }
    }

    /// Terminal states never leave.
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Completed | RunState::Stopped)
    }

    /// Run configuration is editable only before activation, permanently
    /// locked from the moment the run starts.
    pub fn is_editable(self) -> bool {
        matches!(self, RunState::NotScheduled | RunState::Scheduled)
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunState::NotScheduled => "NOT_SCHEDULED",
            RunState::Scheduled => "SCHEDULED",
            RunState::Started => "STARTED",
            RunState::Completed => "COMPLETED",
            RunState::Stopped => "STOPPED",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for RunState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NOT_SCHEDULED" => Ok(RunState::NotScheduled),
            "SCHEDULED" => Ok(RunState::Scheduled),
            "STARTED" => Ok(RunState::Started),
            "COMPLETED" => Ok(RunState::Completed),
            "STOPPED" => Ok(RunState::Stopped),
            other => Err(format!("Unknown run state '{}'", other)),
        }
    }
}

/// A benchmark test definition.
#[derive(Debug, Clone, Serialize)]
pub struct TestRecord {
    pub id: i64,
    pub name: String,
    pub version: i64,
    pub description: Option<String>,
    pub created_at: String,
}

/// Persisted descriptor of one test run: declared schedule plus accumulated
/// results. Timestamps are epoch millis with -1 meaning unset.
#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub id: i64,
    pub test_id: i64,
    pub test: String,
    pub name: String,
    pub version: i64,
    pub description: Option<String>,
    pub scheduled: i64,
    pub started: i64,
    pub stopped: i64,
    pub completed: i64,
    pub progress: f64,
    pub results_success: i64,
    pub results_fail: i64,
    pub results_total: i64,
}

impl RunRecord {
    pub fn state(&self) -> RunState {
        RunState::derive(self.scheduled, self.started, self.stopped, self.completed)
    }

    /// Elapsed run time, or 0 if the run never started or has no end marker.
    /// At most one of stopped/completed is ever set for a valid record.
    pub fn duration(&self) -> i64 {
        debug_assert!(
            self.stopped == UNSET || self.completed == UNSET,
            "run has both stopped and completed timestamps"
        );
        if self.started == UNSET {
            return 0;
        }
        let end = if self.completed != UNSET {
            self.completed
        } else if self.stopped != UNSET {
            self.stopped
        } else {
            return 0;
        };
        end - self.started
    }

    /// Fraction of successful events; 1.0 when nothing has run yet.
    pub fn success_rate(&self) -> f64 {
        if self.results_total == 0 {
            1.0
        } else {
            self.results_success as f64 / (self.results_success + self.results_fail) as f64
        }
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            test: self.test.clone(),
            name: self.name.clone(),
            version: self.version,
            description: self.description.clone(),
            state: self.state().to_string(),
            scheduled: self.scheduled,
            started: self.started,
            stopped: self.stopped,
            completed: self.completed,
            duration: self.duration(),
            progress: self.progress,
            results_success: self.results_success,
            results_fail: self.results_fail,
            results_total: self.results_total,
            success_rate: self.success_rate(),
        }
    }
}

/// Wire-facing view of a run: stored fields plus the derived ones.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub test: String,
    pub name: String,
    pub version: i64,
    pub description: Option<String>,
    pub state: String,
    pub scheduled: i64,
    pub started: i64,
    pub stopped: i64,
    pub completed: i64,
    pub duration: i64,
    pub progress: f64,
    pub results_success: i64,
    pub results_fail: i64,
    pub results_total: i64,
    pub success_rate: f64,
}
