use chrono::{DateTime, Local};
use serde::Serialize;

/// How one task's execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum ExecutionState {
    Built,
    Cached,
    BuildFailed,
    Canceled,
    UpstreamFailed,
}

/// Timing and outcome of one task.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskExecutionSummary {
    #[serde(serialize_with = "serialize_datetime")]
    pub start_time: DateTime<Local>,
    #[serde(serialize_with = "serialize_datetime")]
    pub end_time: DateTime<Local>,
    #[serde(flatten)]
    pub state: ExecutionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl TaskExecutionSummary {
    pub fn duration_ms(&self) -> u64 {
        (self.end_time - self.start_time)
            .num_milliseconds()
            .max(0) as u64
    }
}

fn serialize_datetime<S: serde::Serializer>(
    value: &DateTime<Local>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_i64(value.timestamp_millis())
}

/// Tracks one task from spawn to completion.
pub struct TaskTracker {
    start_time: DateTime<Local>,
}

impl TaskTracker {
    pub fn start() -> Self {
        Self {
            start_time: Local::now(),
        }
    }

    fn finish(self, state: ExecutionState, exit_code: Option<i32>) -> TaskExecutionSummary {
        TaskExecutionSummary {
            start_time: self.start_time,
            end_time: Local::now(),
            state,
            exit_code,
        }
    }

    pub fn built(self, exit_code: i32) -> TaskExecutionSummary {
        self.finish(ExecutionState::Built, Some(exit_code))
    }

    pub fn cached(self) -> TaskExecutionSummary {
        self.finish(ExecutionState::Cached, None)
    }

    pub fn build_failed(self, exit_code: Option<i32>) -> TaskExecutionSummary {
        self.finish(ExecutionState::BuildFailed, exit_code)
    }

    pub fn canceled(self) -> TaskExecutionSummary {
        self.finish(ExecutionState::Canceled, None)
    }

    pub fn upstream_failed(self) -> TaskExecutionSummary {
        self.finish(ExecutionState::UpstreamFailed, None)
    }
}

/// Run-level roll-up of task outcomes.
#[derive(Debug, Default, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSummary {
    pub attempted: usize,
    pub cached: usize,
    pub success: usize,
    pub failed: usize,
    pub exit_code: i32,
}

impl ExecutionSummary {
    pub fn record(&mut self, summary: &TaskExecutionSummary) {
        self.attempted += 1;
        match summary.state {
            ExecutionState::Built => self.success += 1,
            ExecutionState::Cached => {
                self.success += 1;
                self.cached += 1;
            }
            ExecutionState::BuildFailed
            | ExecutionState::Canceled
            | ExecutionState::UpstreamFailed => {
                self.failed += 1;
                self.exit_code = 1;
            }
        }
    }

    /// Every attempted task came straight from cache.
    pub fn is_full_turbo(&self) -> bool {
        self.attempted > 0 && self.cached == self.attempted
    }
}
