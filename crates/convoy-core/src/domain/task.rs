//! Task-queue records: requests submitted through the shared store and the
//! per-node progress entries workers write back.

use serde::{Deserialize, Serialize};

use super::ids::{NodeId, TaskId};
use super::state::TaskState;

/// Which nodes execute a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionMode {
    /// Only the coordinator executes.
    SingleNode,
    /// Every live member executes its own copy.
    AllNodes,
}

/// How the coordinator folds the per-node results of a task into one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Aggregation {
    /// COMPLETED with the first completed node's result if any node
    /// completed, otherwise the first failure.
    #[default]
    AnyCompleted,
    /// The first failure if any node failed, otherwise the first completed
    /// node's result.
    AllCompleted,
    /// Like `AllCompleted`, but a success carries every node's result in one
    /// object keyed by node id.
    CollectAll,
}

impl Aggregation {
    /// Folds the terminal results of the nodes that finished.
    ///
    /// `finished` is `(node, result)`; "first" means lowest node id.
    pub fn combine(self, finished: &[(&str, &ExecutionResult)]) -> ExecutionResult {
        let mut finished = finished.to_vec();
        finished.sort_by(|a, b| a.0.cmp(b.0));
        let completed = finished.iter().find(|(_, r)| r.state == TaskState::Completed);
        let failed = finished.iter().find(|(_, r)| r.state == TaskState::Failed);

        match (self, completed, failed) {
            (_, None, None) => ExecutionResult::failed("No node produced a result."),
            (Aggregation::AnyCompleted, Some((_, r)), _) => (*r).clone(),
            (_, _, Some((_, r))) => (*r).clone(),
            (Aggregation::AllCompleted, Some((_, r)), None) => (*r).clone(),
            (Aggregation::CollectAll, Some(_), None) => {
                let by_node = finished
                    .iter()
                    .map(|(node, r)| {
                        let value = r.result.clone().unwrap_or(serde_json::Value::Null);
                        (node.to_string(), value)
                    })
                    .collect::<serde_json::Map<_, _>>();
                ExecutionResult::completed(serde_json::Value::Object(by_node))
            }
        }
    }
}

/// A unit of work submitted for the task-queue API.
///
/// Stored under `id` in the `task_requests` map until the coordinator
/// collected a terminal result for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRequest {
    pub id: TaskId,
    pub execution_mode: ExecutionMode,
    /// Registered handler type (see [`crate::typed::Task::TYPE`]).
    pub task_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Refuse to run again once a result was recorded in this session.
    #[serde(default)]
    pub once: bool,
    #[serde(default)]
    pub aggregation: Aggregation,
}

impl TaskRequest {
    pub fn new(
        id: impl Into<TaskId>,
        execution_mode: ExecutionMode,
        task_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: id.into(),
            execution_mode,
            task_type: task_type.into(),
            payload,
            once: false,
            aggregation: Aggregation::default(),
        }
    }

    pub fn once(mut self) -> Self {
        self.once = true;
        self
    }

    pub fn with_aggregation(mut self, aggregation: Aggregation) -> Self {
        self.aggregation = aggregation;
        self
    }
}

/// Outcome of a task on one node (or the aggregate over all nodes).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub state: TaskState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutionResult {
    pub fn of(state: TaskState) -> Self {
        Self {
            state,
            result: None,
            error: None,
        }
    }

    pub fn completed(result: serde_json::Value) -> Self {
        Self {
            state: TaskState::Completed,
            result: Some(result),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            state: TaskState::Failed,
            result: None,
            error: Some(error.into()),
        }
    }
}

/// A node's last reported result for a task plus its heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskProgress {
    pub result: ExecutionResult,
    pub last_heartbeat: i64,
}

impl TaskProgress {
    pub fn new(result: ExecutionResult, last_heartbeat: i64) -> Self {
        Self {
            result,
            last_heartbeat,
        }
    }
}

/// Key of a per-node progress entry: `"<taskId>:<nodeId>"`.
///
/// A node only ever writes entries carrying its own id.
pub fn progress_key(task_id: &TaskId, node: &NodeId) -> String {
    format!("{task_id}:{node}")
}

/// Splits a progress key back into `(task id, node part)`.
pub fn split_progress_key(key: &str) -> Option<(&str, &str)> {
    key.rsplit_once(':')
}
