//! GridCompute - ジョブ実行の公開 API
//!
//! # 学習ポイント
//! - 呼び出し側はクロージャを渡すだけ。どのノードが実行し誰が待つかは
//!   [`RunPolicy`] が決める
//! - 本体の失敗は `Ok(JobState::Failed)`、`Err` は協調レイヤーの障害だけ
//! - パイプラインは [`PipelineCoordinator`] に委ね、ステージはタスクループが実行する
//!
//! # 使用例
//! ```ignore
//! let state = node
//!     .compute()
//!     .run_on_one_once("indexBuild", |stop| async move {
//!         rebuild_index(stop).await?;
//!         Ok(())
//!     })
//!     .await?;
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::app::context::NodeContext;
use crate::app::pipeline::{Pipeline, PipelineCoordinator};
use crate::app::policy::{RunPolicy, Work};
use crate::app::task_store::TaskStoreManager;
use crate::app::worker_loop::TaskWorker;
use crate::domain::{ExecutionResult, GridResult, JobState, JobStateAtTime, NodeId, WorkError};

#[derive(Clone)]
pub struct GridCompute {
    ctx: Arc<NodeContext>,
    tasks: TaskStoreManager,
    worker: TaskWorker,
    pipelines: PipelineCoordinator,
}

impl GridCompute {
    pub(crate) fn new(
        ctx: Arc<NodeContext>,
        tasks: TaskStoreManager,
        worker: TaskWorker,
        pipelines: PipelineCoordinator,
    ) -> Self {
        Self {
            ctx,
            tasks,
            worker,
            pipelines,
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.ctx.node_id()
    }

    pub fn is_coordinator(&self) -> bool {
        self.ctx.is_coordinator()
    }

    /// Runs `f` on the coordinator; every other caller waits for its result.
    pub async fn run_on_one<F, Fut>(&self, job_name: &str, f: F) -> GridResult<JobState>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), WorkError>> + Send + 'static,
    {
        self.execute(RunPolicy::SingleNode, job_name, false, Work::new(f)).await
    }

    /// Like [`run_on_one`](Self::run_on_one), skipped when the job already
    /// ran in this session.
    pub async fn run_on_one_once<F, Fut>(&self, job_name: &str, f: F) -> GridResult<JobState>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), WorkError>> + Send + 'static,
    {
        self.execute(RunPolicy::SingleNode, job_name, true, Work::new(f)).await
    }

    /// Runs `f` on every node; returns the cluster-wide aggregate.
    pub async fn run_on_all<F, Fut>(&self, job_name: &str, f: F) -> GridResult<JobState>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), WorkError>> + Send + 'static,
    {
        self.execute(RunPolicy::AllNodes, job_name, false, Work::new(f)).await
    }

    pub async fn run_on_all_once<F, Fut>(&self, job_name: &str, f: F) -> GridResult<JobState>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), WorkError>> + Send + 'static,
    {
        self.execute(RunPolicy::AllNodes, job_name, true, Work::new(f)).await
    }

    pub async fn execute(
        &self,
        policy: RunPolicy,
        job_name: &str,
        once: bool,
        work: Work,
    ) -> GridResult<JobState> {
        policy.execute(&self.ctx, job_name, once, work).await
    }

    /// Asks every node to stop the job or task running under `name`.
    ///
    /// Returns how many bodies were stopped on this node.
    pub async fn stop(&self, name: &str) -> GridResult<usize> {
        self.ctx.request_stop(name).await
    }

    /// Runs `pipeline` stage by stage as grid tasks.
    ///
    /// Starts this node's task loop first, since stages are executed by the
    /// workers. Every node may call this; only the coordinator drives the
    /// stages and the others wait for its last stage result.
    pub async fn execute_pipeline(&self, pipeline: &Pipeline) -> GridResult<Option<ExecutionResult>> {
        self.worker.start();
        self.pipelines.execute(pipeline).await
    }

    /// Skips the remaining stages of pipeline `id` and stops its active stage.
    pub async fn stop_pipeline(&self, id: &str) -> GridResult<()> {
        self.pipelines.stop(id).await
    }

    /// Stage index pipeline `id` is running, `-1` when no run is active.
    pub async fn pipeline_active_stage(&self, id: &str) -> i64 {
        self.pipelines.active_stage(id).await
    }

    /// Starts a new run-once session for the whole cluster.
    ///
    /// Clears the persisted job states and task maps, plus this node's
    /// caches. Other nodes keep their local task bookkeeping until they
    /// reset too.
    pub async fn reset_session(&self) -> bool {
        let jobs = self.ctx.job_states.reset().await;
        let tasks = self.tasks.reset().await;
        let pipelines = self.pipelines.reset().await;
        self.worker.reset();
        self.ctx.clear_local();
        tracing::info!(node = %self.ctx.node_id(), jobs, tasks, pipelines, "Session reset");
        jobs || tasks || pipelines
    }

    pub async fn job_state(&self, job_name: &str) -> Option<JobStateAtTime> {
        self.ctx.job_states.get_at_time(job_name).await
    }

    pub async fn running_jobs(&self) -> HashMap<String, JobStateAtTime> {
        self.ctx.job_states.running_jobs().await
    }
}
