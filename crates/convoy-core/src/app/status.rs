//! Status - ノードの状態スナップショット
//!
//! ログやデモ CLI で「いま何が動いているか」を説明するための読み取り専用ビュー。

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::domain::{JobStateAtTime, NodeId};

/// Local bookkeeping of a task worker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub polling: bool,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
}

/// What one node knows about itself and the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub node: NodeId,
    pub coordinator: Option<NodeId>,
    pub members: usize,
    /// Persisted jobs currently RUNNING, by name.
    pub running_jobs: BTreeMap<String, JobStateAtTime>,
    pub worker: WorkerStatus,
}

impl NodeStatus {
    pub fn is_coordinator(&self) -> bool {
        self.coordinator == Some(self.node)
    }
}
