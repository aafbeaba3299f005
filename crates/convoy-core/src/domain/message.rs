//! Messages exchanged between nodes.
//!
//! - [`GridMessage`]: 非保証の pub/sub（group channel）で流すもの
//! - [`GridCommand`] / [`GridReply`]: remote dispatch の型付きコマンド
//!   （メソッド名 + 引数配列の代わり）

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::state::JobStateAtTime;
use super::task::ExecutionResult;

/// A state observation for a job name.
///
/// Used both as a heartbeat (node-scoped sub-jobs) and as the terminal
/// announcement of a job's canonical state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStateMessage {
    pub job_name: String,
    pub observed_state: JobStateAtTime,
}

impl JobStateMessage {
    pub fn new(job_name: impl Into<String>, observed_state: JobStateAtTime) -> Self {
        Self {
            job_name: job_name.into(),
            observed_state,
        }
    }
}

/// Cooperative cancellation request for a job name or task id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopMessage {
    pub job_name: String,
}

/// Lifecycle signal of a pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "lastResult", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineSignal {
    /// The coordinator began a run; earlier done signals are void.
    Started,
    /// Skip the remaining stages and stop the active one.
    Stop,
    /// The run ended with this last stage result.
    Done(Option<ExecutionResult>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineMessage {
    pub pipeline_id: String,
    pub signal: PipelineSignal,
}

impl PipelineMessage {
    pub fn new(pipeline_id: impl Into<String>, signal: PipelineSignal) -> Self {
        Self {
            pipeline_id: pipeline_id.into(),
            signal,
        }
    }
}

/// Best-effort broadcast payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body")]
pub enum GridMessage {
    JobState(JobStateMessage),
    Stop(StopMessage),
    Pipeline(PipelineMessage),
}

/// Commands carried by the remote dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body")]
pub enum GridCommand {
    /// Heartbeat to the coordinator, or terminal announcement from it.
    ReportState(JobStateMessage),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GridReply {
    /// The receiver recorded the command.
    Ack,
    /// The receiver is not the intended consumer.
    Ignored,
}

/// How many replies `call_many` waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseMode {
    /// Fire-and-forget.
    None,
    /// Return as soon as one reply arrived.
    First,
    /// Wait for every target, up to the timeout.
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestOptions {
    pub mode: ResponseMode,
    pub timeout: Duration,
}

impl RequestOptions {
    pub fn no_wait() -> Self {
        Self {
            mode: ResponseMode::None,
            timeout: Duration::ZERO,
        }
    }

    pub fn wait_all(timeout: Duration) -> Self {
        Self {
            mode: ResponseMode::All,
            timeout,
        }
    }

    pub fn wait_first(timeout: Duration) -> Self {
        Self {
            mode: ResponseMode::First,
            timeout,
        }
    }
}
