//! TaskStoreManager - タスクキュー API が使う 3 つの共有マップ
//!
//! - `task_requests`: taskId → TaskRequest（coordinator が書き、ワーカーが読む）
//! - `task_progress`: "taskId:nodeId" → TaskProgress（各ノードが自分の分だけ書く）
//! - `terminated_tasks`: taskId → ExecutionResult（coordinator の集約結果）

use crate::domain::task::{progress_key, split_progress_key};
use crate::domain::{ExecutionResult, GridResult, NodeId, TaskId, TaskProgress, TaskRequest};
use crate::ports::{GridStore, TypedMap};

pub const TASK_REQUESTS_MAP: &str = "task_requests";
pub const TASK_PROGRESS_MAP: &str = "task_progress";
pub const TERMINATED_TASKS_MAP: &str = "terminated_tasks";

#[derive(Clone)]
pub struct TaskStoreManager {
    requests: TypedMap<TaskRequest>,
    progress: TypedMap<TaskProgress>,
    terminated: TypedMap<ExecutionResult>,
}

impl TaskStoreManager {
    pub fn new(store: &dyn GridStore) -> Self {
        Self {
            requests: TypedMap::new(store.map(TASK_REQUESTS_MAP)),
            progress: TypedMap::new(store.map(TASK_PROGRESS_MAP)),
            terminated: TypedMap::new(store.map(TERMINATED_TASKS_MAP)),
        }
    }

    /// Outstanding requests.
    pub async fn requests(&self) -> Vec<TaskRequest> {
        self.requests
            .entries()
            .await
            .into_iter()
            .map(|(_, r)| r)
            .collect()
    }

    pub async fn has_request(&self, id: &TaskId) -> bool {
        self.requests.contains_key(id.as_str()).await
    }

    pub async fn put_request(&self, request: &TaskRequest) -> GridResult<()> {
        self.requests.put(request.id.as_str(), request).await?;
        Ok(())
    }

    pub async fn remove_request(&self, id: &TaskId) -> bool {
        self.requests.remove(id.as_str()).await
    }

    /// Writes this node's own progress entry for `id`.
    pub async fn set_progress(&self, id: &TaskId, node: &NodeId, progress: &TaskProgress) -> GridResult<()> {
        self.progress.put(&progress_key(id, node), progress).await?;
        Ok(())
    }

    /// Every node's entry for `id`, keyed by the node part of the key.
    pub async fn progress_of(&self, id: &TaskId) -> Vec<(String, TaskProgress)> {
        self.progress
            .entries()
            .await
            .into_iter()
            .filter_map(|(key, p)| match split_progress_key(&key) {
                Some((task, node)) if task == id.as_str() => Some((node.to_string(), p)),
                _ => None,
            })
            .collect()
    }

    pub async fn clear_progress(&self, id: &TaskId) {
        let prefix = format!("{id}:");
        for (key, _) in self.progress.raw().entries().await {
            if key.starts_with(&prefix) {
                self.progress.remove(&key).await;
            }
        }
    }

    pub async fn terminated(&self, id: &TaskId) -> GridResult<Option<ExecutionResult>> {
        self.terminated.get(id.as_str()).await
    }

    pub async fn set_terminated(&self, id: &TaskId, result: &ExecutionResult) -> GridResult<()> {
        self.terminated.put(id.as_str(), result).await?;
        Ok(())
    }

    /// Clears all three maps. Returns whether anything was present.
    pub async fn reset(&self) -> bool {
        let requests = self.requests.clear().await;
        let progress = self.progress.clear().await;
        let terminated = self.terminated.clear().await;
        requests || progress || terminated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ExecutionMode, TaskState};
    use crate::impls::InMemoryGridStore;

    fn request(id: &str) -> TaskRequest {
        TaskRequest::new(id, ExecutionMode::AllNodes, "test.echo.v1", serde_json::json!({}))
    }

    #[tokio::test]
    async fn progress_is_grouped_by_task() {
        let grid = InMemoryGridStore::new();
        let tasks = TaskStoreManager::new(&grid);
        let (a, b) = (NodeId::generate(), NodeId::generate());
        let running = TaskProgress::new(ExecutionResult::of(TaskState::Running), 1);

        tasks.set_progress(&TaskId::from("t1"), &a, &running).await.unwrap();
        tasks.set_progress(&TaskId::from("t1"), &b, &running).await.unwrap();
        tasks.set_progress(&TaskId::from("t10"), &a, &running).await.unwrap();

        let mut nodes: Vec<String> = tasks
            .progress_of(&TaskId::from("t1"))
            .await
            .into_iter()
            .map(|(n, _)| n)
            .collect();
        nodes.sort();
        let mut expected = vec![a.to_string(), b.to_string()];
        expected.sort();
        assert_eq!(nodes, expected);

        tasks.clear_progress(&TaskId::from("t1")).await;
        assert!(tasks.progress_of(&TaskId::from("t1")).await.is_empty());
        assert_eq!(tasks.progress_of(&TaskId::from("t10")).await.len(), 1);
    }

    #[tokio::test]
    async fn requests_round_trip_and_reset() {
        let grid = InMemoryGridStore::new();
        let tasks = TaskStoreManager::new(&grid);
        tasks.put_request(&request("t1")).await.unwrap();
        assert!(tasks.has_request(&TaskId::from("t1")).await);
        assert_eq!(tasks.requests().await, vec![request("t1")]);

        tasks
            .set_terminated(&TaskId::from("t0"), &ExecutionResult::failed("x"))
            .await
            .unwrap();
        assert!(tasks.reset().await);
        assert!(tasks.requests().await.is_empty());
        assert_eq!(tasks.terminated(&TaskId::from("t0")).await.unwrap(), None);
        assert!(!tasks.reset().await);
    }

    #[tokio::test]
    async fn destroyed_store_reads_empty() {
        let grid = InMemoryGridStore::new();
        let tasks = TaskStoreManager::new(&grid);
        tasks.put_request(&request("t1")).await.unwrap();
        grid.destroy();
        assert!(tasks.requests().await.is_empty());
        assert!(!tasks.has_request(&TaskId::from("t1")).await);
    }
}
