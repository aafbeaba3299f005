//! TaskCoordinator - タスク要求の投入と、ノードごとの進捗の集約
//!
//! # 集約ルール（[`aggregate_progress`]）
//! - 対象ノード: ALL_NODES なら現在のメンバー全員、SINGLE_NODE なら coordinator のみ
//! - 対象ノードが非終端（または未報告）で新鮮なうちは待つ
//! - staleness 窓を超えて黙っているノードは除外
//! - 全員が終端 → 要求の [`Aggregation`] で 1 つにまとめる
//!   （既定は COMPLETED が 1 つでもあればそれ、無ければ FAILED）
//!
//! どのノードのハートビートも `inactive_coord_timeout` より新しくならなければ
//! FAILED "Expired." で打ち切る。

use std::sync::Arc;

use crate::app::context::NodeContext;
use crate::app::task_store::TaskStoreManager;
use crate::domain::{
    Aggregation, ExecutionMode, ExecutionResult, GridError, GridResult, NodeId, TaskId,
    TaskProgress, TaskRequest, TaskState,
};

pub const EXPIRED: &str = "Expired.";
pub const INTERRUPTED: &str = "Interrupted.";

#[derive(Clone)]
pub struct TaskCoordinator {
    ctx: Arc<NodeContext>,
    store: TaskStoreManager,
}

impl TaskCoordinator {
    pub(crate) fn new(ctx: Arc<NodeContext>, store: TaskStoreManager) -> Self {
        Self { ctx, store }
    }

    /// Publishes `request` for the workers to pick up.
    ///
    /// A `once` request whose id already has a result in this session is not
    /// published; a FAILED result is recorded for it instead.
    pub async fn submit(&self, request: TaskRequest) -> GridResult<()> {
        if !self.ctx.is_coordinator() {
            return Err(GridError::NotCoordinator("submit task requests"));
        }
        if self.store.has_request(&request.id).await {
            return Err(GridError::DuplicateTask(request.id));
        }
        if let Some(previous) = self.store.terminated(&request.id).await? {
            if request.once {
                tracing::error!(
                    task = %request.id,
                    state = ?previous.state,
                    "Task is marked to run once but already ran in this session"
                );
                let refused = ExecutionResult::failed(format!(
                    "Task already ran in this session with state: {:?}",
                    previous.state
                ));
                return self.store.set_terminated(&request.id, &refused).await;
            }
            tracing::info!(task = %request.id, "Task already ran in this session, result is kept");
            return Ok(());
        }

        self.store.clear_progress(&request.id).await;
        self.store.put_request(&request).await?;
        tracing::info!(task = %request.id, mode = ?request.execution_mode, "Task request submitted");
        Ok(())
    }

    /// Waits for the aggregate result of `id` and records it.
    pub async fn await_result(&self, id: &TaskId) -> GridResult<ExecutionResult> {
        if let Some(done) = self.store.terminated(id).await? {
            self.store.remove_request(id).await;
            return Ok(done);
        }
        let Some(request) = self.find_request(id).await else {
            return Err(GridError::Config(format!("no task request {id} was submitted")));
        };

        let ctx = &self.ctx;
        let stale_ms = millis(ctx.config.node_stale_timeout());
        let inactive_ms = millis(ctx.config.inactive_coord_timeout());
        let since = ctx.clock.now_millis();
        let mut last_activity = since;

        let result = loop {
            let progress = self.store.progress_of(id).await;
            last_activity = progress
                .iter()
                .map(|(_, p)| p.last_heartbeat)
                .fold(last_activity, i64::max);

            let now = ctx.clock.now_millis();
            let required = match request.execution_mode {
                ExecutionMode::AllNodes => ctx.channel.members(),
                ExecutionMode::SingleNode => vec![ctx.node_id()],
            };
            let folded = aggregate_progress(&progress, &required, request.aggregation, now, since, stale_ms);
            if let Some(result) = folded {
                break result;
            }
            if now - last_activity > inactive_ms {
                tracing::error!(task = %id, "No worker activity for too long, giving up");
                break ExecutionResult::failed(EXPIRED);
            }

            tokio::select! {
                _ = ctx.scheduler.token().cancelled() => {
                    tracing::warn!(task = %id, "Wait for task result interrupted");
                    break ExecutionResult::failed(INTERRUPTED);
                }
                _ = tokio::time::sleep(ctx.config.task_progress_poll_interval()) => {}
            }
        };

        self.store.set_terminated(id, &result).await?;
        self.store.remove_request(id).await;
        self.store.clear_progress(id).await;
        if result.state == TaskState::Failed {
            tracing::error!(task = %id, error = ?result.error, "Task failed");
        } else {
            tracing::info!(task = %id, "Task completed");
        }
        Ok(result)
    }

    /// Submits and waits in one call.
    pub async fn execute(&self, request: TaskRequest) -> GridResult<ExecutionResult> {
        let id = request.id.clone();
        self.submit(request).await?;
        self.await_result(&id).await
    }

    async fn find_request(&self, id: &TaskId) -> Option<TaskRequest> {
        self.store
            .requests()
            .await
            .into_iter()
            .find(|r| &r.id == id)
    }
}

fn millis(d: std::time::Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

/// Aggregate of the per-node progress entries of one task, or `None` while
/// some required node may still report.
///
/// `waiting_since` is when the coordinator started waiting; a required node
/// that never reported is excluded once that is older than `stale_ms`.
pub fn aggregate_progress(
    progress: &[(String, TaskProgress)],
    required: &[NodeId],
    aggregation: Aggregation,
    now: i64,
    waiting_since: i64,
    stale_ms: i64,
) -> Option<ExecutionResult> {
    let mut finished: Vec<(&str, &ExecutionResult)> = Vec::new();
    let mut silent = Vec::new();
    for node in required {
        let key = node.to_string();
        match progress.iter().find(|(n, _)| *n == key) {
            Some((n, p)) if p.result.state.is_terminal() => finished.push((n.as_str(), &p.result)),
            Some((_, p)) if now - p.last_heartbeat <= stale_ms => return None,
            None if now - waiting_since <= stale_ms => return None,
            _ => silent.push(key),
        }
    }
    for node in &silent {
        tracing::warn!(node = %node, "Node went silent, excluding it from the task result");
    }
    Some(aggregation.combine(&finished))
}
