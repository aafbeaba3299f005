//! State - ジョブ/タスクの状態
//!
//! # 状態遷移
//! - IDLE -> RUNNING -> COMPLETED
//! - IDLE -> RUNNING -> FAILED
//!
//! 1 回の実行の中では前進のみ（終端状態から RUNNING へは戻らない）。
//! 永続化フォーマットは序数（0..3）。

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle stage of a job.
///
/// Variants are declared in ordinal order; the derived `Ord` is used by the
/// barrier to pick the "highest" terminal state among nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum JobState {
    Idle,
    Running,
    Completed,
    Failed,
}

impl JobState {
    /// True once the job reached a terminal state (COMPLETED or FAILED).
    pub fn has_ran(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    pub fn is_running(self) -> bool {
        self == JobState::Running
    }

    /// Alias of [`JobState::has_ran`], reads better at aggregation sites.
    pub fn is_terminal(self) -> bool {
        self.has_ran()
    }

    pub fn ordinal(self) -> u8 {
        self.into()
    }
}

impl From<JobState> for u8 {
    fn from(state: JobState) -> Self {
        match state {
            JobState::Idle => 0,
            JobState::Running => 1,
            JobState::Completed => 2,
            JobState::Failed => 3,
        }
    }
}

/// Persisted value outside of `0..=3`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid job state ordinal: {0}")]
pub struct InvalidJobState(pub u8);

impl TryFrom<u8> for JobState {
    type Error = InvalidJobState;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(JobState::Idle),
            1 => Ok(JobState::Running),
            2 => Ok(JobState::Completed),
            3 => Ok(JobState::Failed),
            other => Err(InvalidJobState(other)),
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Idle => "IDLE",
            JobState::Running => "RUNNING",
            JobState::Completed => "COMPLETED",
            JobState::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// A state observation: state + epoch-millis timestamp.
///
/// This is also the persisted record format for a job name
/// (`{"state": 0..3, "timestampMillis": i64}`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStateAtTime {
    pub state: JobState,
    pub timestamp_millis: i64,
}

impl JobStateAtTime {
    pub fn new(state: JobState, timestamp_millis: i64) -> Self {
        Self {
            state,
            timestamp_millis,
        }
    }
}

/// Per-node task state for the task-queue API.
///
/// PENDING means "seen but not eligible on this node".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed)
    }
}
