//! TaskWorker - 共有ストアのタスク要求をポーリングして実行するループ
//!
//! # フロー（1 回のポーリング）
//! 1. `task_requests` を読む
//! 2. 各要求について（このプロセスで終了済みのものは飛ばす）
//!    - 実行中 → RUNNING ハートビートを書く
//!    - 実行可能（ALL_NODES、または SINGLE_NODE かつ自分が coordinator）→ 非同期に開始
//!    - それ以外 → PENDING を書く
//! 3. 実行中なのに要求が消えたもの（孤児）は停止して追跡から外す
//!
//! 要求が 1 件も無い状態が `inactive_coord_timeout` 続くとループは自分で止まる。
//!
//! # at-most-once
//! 実行の終わり（正常・失敗・panic）に必ず running → terminated へ移す。
//! terminated は session reset まで残るので、同じ taskId は二度と起動しない。

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use dashmap::DashMap;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::app::context::NodeContext;
use crate::app::status::WorkerStatus;
use crate::app::task_store::TaskStoreManager;
use crate::domain::{ExecutionMode, ExecutionResult, TaskId, TaskProgress, TaskRequest, TaskState};
use crate::typed::{TaskContext, TypedRegistry};

#[derive(Clone)]
pub struct TaskWorker {
    inner: Arc<WorkerInner>,
}

struct WorkerInner {
    ctx: Arc<NodeContext>,
    store: TaskStoreManager,
    registry: Arc<TypedRegistry>,
    running: DashMap<TaskId, CancellationToken>,
    terminated: DashMap<TaskId, TaskState>,
    polling: AtomicBool,
    loop_token: Mutex<Option<CancellationToken>>,
    /// Held by a poll pass and by a task's final write, so a heartbeat can
    /// never land after a terminal result.
    progress_lock: tokio::sync::Mutex<()>,
}

impl TaskWorker {
    pub(crate) fn new(ctx: Arc<NodeContext>, store: TaskStoreManager, registry: Arc<TypedRegistry>) -> Self {
        Self {
            inner: Arc::new(WorkerInner {
                ctx,
                store,
                registry,
                running: DashMap::new(),
                terminated: DashMap::new(),
                polling: AtomicBool::new(false),
                loop_token: Mutex::new(None),
                progress_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Starts the poll loop. Returns false when it is already polling.
    pub fn start(&self) -> bool {
        if self.inner.polling.swap(true, Ordering::SeqCst) {
            return false;
        }
        let token = self.inner.ctx.scheduler.child_token();
        *self
            .inner
            .loop_token
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(token.clone());

        let worker = self.clone();
        self.inner.ctx.scheduler.spawn(async move {
            worker.poll_loop(token).await;
            worker.inner.polling.store(false, Ordering::SeqCst);
        });
        true
    }

    /// Ends the poll loop and stops every running task.
    pub fn stop(&self) {
        if let Some(token) = self
            .inner
            .loop_token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            token.cancel();
        }
        for entry in self.inner.running.iter() {
            tracing::info!(task = %entry.key(), "Stopping task");
            entry.value().cancel();
        }
    }

    pub fn status(&self) -> WorkerStatus {
        let (mut completed, mut failed) = (0, 0);
        for entry in self.inner.terminated.iter() {
            match entry.value() {
                TaskState::Completed => completed += 1,
                _ => failed += 1,
            }
        }
        WorkerStatus {
            polling: self.inner.polling.load(Ordering::SeqCst),
            running: self.inner.running.len(),
            completed,
            failed,
        }
    }

    /// Forgets which tasks this process already ran.
    pub(crate) fn reset(&self) {
        self.inner.terminated.clear();
    }

    async fn poll_loop(&self, token: CancellationToken) {
        let ctx = &self.inner.ctx;
        let inactive = ctx.config.inactive_coord_timeout();
        let mut last_with_tasks = Instant::now();
        tracing::info!(node = %ctx.node_id(), "Task worker polling");

        loop {
            let outstanding = self.poll_once().await;
            if outstanding > 0 {
                last_with_tasks = Instant::now();
            } else if last_with_tasks.elapsed() > inactive {
                tracing::warn!(node = %ctx.node_id(), "No task requests for a while, worker stops polling");
                break;
            }

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(ctx.config.task_poll_interval()) => {}
            }
        }
        tracing::debug!(node = %ctx.node_id(), "Task worker stopped");
    }

    /// One pass over the outstanding requests. Returns how many there were.
    pub(crate) async fn poll_once(&self) -> usize {
        let _pass = self.inner.progress_lock.lock().await;
        let requests = self.inner.store.requests().await;
        let mut active = HashSet::with_capacity(requests.len());

        for request in &requests {
            active.insert(request.id.clone());
            if self.inner.terminated.contains_key(&request.id) {
                continue;
            }
            if self.inner.running.contains_key(&request.id) {
                self.write_state(&request.id, TaskState::Running).await;
            } else if self.can_execute(request) {
                self.start_task(request.clone()).await;
            } else {
                self.write_state(&request.id, TaskState::Pending).await;
            }
        }

        let orphans: Vec<TaskId> = self
            .inner
            .running
            .iter()
            .filter(|e| !active.contains(e.key()))
            .map(|e| e.key().clone())
            .collect();
        for id in orphans {
            if let Some((_, token)) = self.inner.running.remove(&id) {
                tracing::warn!(task = %id, "Task request is gone, stopping orphaned task");
                token.cancel();
            }
        }

        requests.len()
    }

    fn can_execute(&self, request: &TaskRequest) -> bool {
        match request.execution_mode {
            ExecutionMode::AllNodes => true,
            ExecutionMode::SingleNode => self.inner.ctx.is_coordinator(),
        }
    }

    async fn write_state(&self, id: &TaskId, state: TaskState) {
        self.write_progress(id, ExecutionResult::of(state)).await;
    }

    async fn write_progress(&self, id: &TaskId, result: ExecutionResult) {
        let ctx = &self.inner.ctx;
        let progress = TaskProgress::new(result, ctx.now_millis());
        if let Err(e) = self.inner.store.set_progress(id, &ctx.node_id(), &progress).await {
            tracing::warn!(task = %id, error = %e, "Could not write task progress");
        }
    }

    async fn start_task(&self, request: TaskRequest) {
        let ctx = Arc::clone(&self.inner.ctx);
        let id = request.id.clone();

        let handler = match self.inner.registry.require(&request.task_type) {
            Ok(h) => h,
            Err(e) => {
                tracing::error!(task = %id, error = %e, "Cannot execute task");
                self.inner.terminated.insert(id.clone(), TaskState::Failed);
                self.write_progress(&id, ExecutionResult::failed(e.to_string())).await;
                return;
            }
        };

        let guard = ctx.stops.register(id.as_str(), ctx.scheduler.token());
        let stop = guard.token();
        self.inner.running.insert(id.clone(), stop.clone());
        self.write_state(&id, TaskState::Running).await;
        tracing::info!(task = %id, node = %ctx.node_id(), "Task started");

        let worker = self.clone();
        let scheduler = ctx.scheduler.clone();
        scheduler.spawn(async move {
            let mut finish = Finish {
                worker: worker.clone(),
                id: id.clone(),
                state: TaskState::Failed,
            };
            let task_ctx = TaskContext {
                task_id: id.clone(),
                node: ctx.node_id(),
                stop,
            };
            let run = ctx.scheduler.spawn(async move { handler.handle_dyn(request.payload, task_ctx).await });
            let result = match run.await {
                Ok(Ok(value)) => {
                    tracing::info!(task = %id, node = %ctx.node_id(), "Task completed");
                    ExecutionResult::completed(value)
                }
                Ok(Err(e)) => {
                    tracing::error!(task = %id, node = %ctx.node_id(), error = %e, "Task failed");
                    ExecutionResult::failed(e.to_string())
                }
                Err(e) => {
                    tracing::error!(task = %id, node = %ctx.node_id(), error = %e, "Task panicked");
                    ExecutionResult::failed(format!("task panicked: {e}"))
                }
            };
            finish.state = result.state;
            drop(guard);
            let _pass = worker.inner.progress_lock.lock().await;
            drop(finish);
            worker.write_progress(&id, result).await;
        });
    }
}

/// Moves a task from `running` to `terminated` whatever way it ended.
struct Finish {
    worker: TaskWorker,
    id: TaskId,
    state: TaskState,
}

impl Drop for Finish {
    fn drop(&mut self) {
        self.worker.inner.terminated.insert(self.id.clone(), self.state);
        self.worker.inner.running.remove(&self.id);
    }
}
