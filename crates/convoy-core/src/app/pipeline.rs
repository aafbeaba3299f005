//! Pipeline - 順序付きステージを 1 つずつグリッドタスクとして実行する
//!
//! # 学習ポイント
//! - ステージの実行は [`TaskCoordinator::execute`] に任せる（実行するのはワーカーループ）
//! - 実行中のステージ番号と直前のステージ結果を共有ストアに置き、
//!   途中で止まった run を次の coordinator が再開できるようにする
//! - coordinator 以外のノードは「完了」シグナルを `oneshot` で待つ
//!
//! # ステージの扱い（先頭から順に判定）
//! 1. 再開位置より前 → スキップ
//! 2. 停止要求の後 → スキップ
//! 3. 先行ステージが失敗 → `always` でなければスキップ
//! 4. タスクを作らなかった（条件不成立）→ スキップ
//! 5. `once` でこのセッション中に実行済み → スキップ
//!    （`once` でなければタスク側の規則どおり、記録済みの結果がそのまま返る）
//! 6. それ以外 → アクティブとして記録し、実行して結果を保存
//!
//! # 共有マップ
//! - `pipelineActiveStage`: pipelineId → 実行中のステージ番号（run の終了後は -1）
//! - `pipelineLastResult`: pipelineId → 直前のステージ結果（run の終了後は削除）

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{Notify, oneshot};

use crate::app::context::NodeContext;
use crate::app::task_coordinator::{INTERRUPTED, TaskCoordinator};
use crate::app::task_store::TaskStoreManager;
use crate::domain::{
    ExecutionResult, GridError, GridMessage, GridResult, PipelineMessage, PipelineSignal,
    TaskRequest, TaskState,
};
use crate::ports::{GridStore, TypedMap};

pub const PIPELINE_ACTIVE_STAGE_MAP: &str = "pipelineActiveStage";
pub const PIPELINE_LAST_RESULT_MAP: &str = "pipelineLastResult";

/// Stored stage index of a pipeline whose last run went through every stage.
pub const NO_ACTIVE_STAGE: i64 = -1;

type TaskProvider = Box<dyn Fn(Option<&ExecutionResult>) -> Option<TaskRequest> + Send + Sync>;

/// One step of a [`Pipeline`].
pub struct Stage {
    provider: TaskProvider,
    always: bool,
}

impl Stage {
    /// A stage that always submits `request`.
    pub fn task(request: TaskRequest) -> Self {
        Self::from_fn(move |_| Some(request.clone()))
    }

    /// A stage whose task is built from the previous stage result.
    ///
    /// Returning `None` skips the stage.
    pub fn from_fn<F>(provider: F) -> Self
    where
        F: Fn(Option<&ExecutionResult>) -> Option<TaskRequest> + Send + Sync + 'static,
    {
        Self {
            provider: Box::new(provider),
            always: false,
        }
    }

    /// Runs even when an earlier stage failed.
    pub fn always(mut self) -> Self {
        self.always = true;
        self
    }
}

/// Named, ordered list of stages.
///
/// ```ignore
/// let nightly = Pipeline::new("nightly", vec![
///     Stage::task(Crawl { .. }.into_request("crawl", ExecutionMode::AllNodes)?),
///     Stage::task(Publish { .. }.into_request("publish", ExecutionMode::SingleNode)?),
///     Stage::task(Cleanup {}.into_request("cleanup", ExecutionMode::AllNodes)?).always(),
/// ]);
/// ```
pub struct Pipeline {
    id: String,
    stages: Vec<Stage>,
}

impl Pipeline {
    pub fn new(id: impl Into<String>, stages: Vec<Stage>) -> Self {
        Self {
            id: id.into(),
            stages,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

type DoneSender = oneshot::Sender<Option<ExecutionResult>>;

#[derive(Default)]
struct SignalState {
    waiters: HashMap<String, Vec<DoneSender>>,
    done: HashMap<String, Option<ExecutionResult>>,
    stops: HashSet<String>,
}

/// Pipeline signals received by one node.
///
/// A done signal goes to the callers waiting at arrival; with nobody waiting
/// it is parked for the next caller. A `Started` signal voids a parked one.
#[derive(Default)]
pub(crate) struct PipelineSignals {
    state: Mutex<SignalState>,
    stop_requested: Notify,
}

impl PipelineSignals {
    fn lock(&self) -> MutexGuard<'_, SignalState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn on_signal(&self, msg: PipelineMessage) {
        let id = msg.pipeline_id.as_str();
        match msg.signal {
            PipelineSignal::Started => {
                let mut state = self.lock();
                state.done.remove(id);
                state.stops.remove(id);
            }
            PipelineSignal::Stop => self.request_stop(id),
            PipelineSignal::Done(result) => self.done(id, result),
        }
    }

    fn done(&self, id: &str, result: Option<ExecutionResult>) {
        let mut state = self.lock();
        state.stops.remove(id);
        let delivered = state
            .waiters
            .remove(id)
            .unwrap_or_default()
            .into_iter()
            .map(|tx| tx.send(result.clone()).is_ok())
            .filter(|ok| *ok)
            .count();
        if delivered == 0 {
            state.done.insert(id.to_string(), result);
        }
        tracing::debug!(pipeline = id, delivered, "Pipeline done signal received");
    }

    pub(crate) fn subscribe_done(&self, id: &str) -> oneshot::Receiver<Option<ExecutionResult>> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.lock();
        if let Some(parked) = state.done.remove(id) {
            // receiver is alive right here
            let _ = tx.send(parked);
            return rx;
        }
        state.waiters.entry(id.to_string()).or_default().push(tx);
        rx
    }

    pub(crate) fn request_stop(&self, id: &str) {
        self.lock().stops.insert(id.to_string());
        self.stop_requested.notify_waiters();
    }

    fn take_stop(&self, id: &str) -> bool {
        self.lock().stops.remove(id)
    }

    /// Resolves once a stop for `id` is requested, consuming it.
    async fn stopped(&self, id: &str) {
        loop {
            let notified = self.stop_requested.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.take_stop(id) {
                return;
            }
            notified.await;
        }
    }

    /// Drops parked done signals and remembered stops. Waiters stay.
    pub(crate) fn clear(&self) {
        let mut state = self.lock();
        state.done.clear();
        state.stops.clear();
    }
}

/// Runs pipelines on the coordinator and lets every other node wait for
/// the outcome.
#[derive(Clone)]
pub struct PipelineCoordinator {
    ctx: Arc<NodeContext>,
    tasks: TaskCoordinator,
    task_store: TaskStoreManager,
    active_stage: TypedMap<i64>,
    last_result: TypedMap<ExecutionResult>,
}

impl PipelineCoordinator {
    pub(crate) fn new(
        ctx: Arc<NodeContext>,
        store: &dyn GridStore,
        tasks: TaskCoordinator,
        task_store: TaskStoreManager,
    ) -> Self {
        Self {
            ctx,
            tasks,
            task_store,
            active_stage: TypedMap::new(store.map(PIPELINE_ACTIVE_STAGE_MAP)),
            last_result: TypedMap::new(store.map(PIPELINE_LAST_RESULT_MAP)),
        }
    }

    /// Runs `pipeline` and returns its last stage result.
    ///
    /// On the coordinator this drives the stages; anywhere else it waits for
    /// the coordinator's done signal. `None` means no stage produced a
    /// result.
    pub async fn execute(&self, pipeline: &Pipeline) -> GridResult<Option<ExecutionResult>> {
        if self.ctx.scheduler.is_shut_down() {
            return Err(GridError::Shutdown);
        }
        if pipeline.is_empty() {
            return Err(GridError::InvalidPipeline(
                pipeline.id.clone(),
                "stage list must not be empty",
            ));
        }
        if !self.ctx.is_coordinator() {
            return Ok(self.await_done(pipeline.id()).await);
        }

        let id = pipeline.id();
        // stops aimed at an earlier run do not carry over
        self.ctx
            .pipelines
            .on_signal(PipelineMessage::new(id, PipelineSignal::Started));
        self.broadcast(id, PipelineSignal::Started).await;
        let last = match self.run_stages(pipeline).await {
            Ok(last) => last,
            Err(GridError::Shutdown) => {
                tracing::warn!(pipeline = id, "Node shut down mid-pipeline, run left for resuming");
                return Err(GridError::Shutdown);
            }
            Err(e) => {
                tracing::error!(pipeline = id, error = %e, "Pipeline aborted");
                Some(ExecutionResult::failed(e.to_string()))
            }
        };
        self.broadcast(id, PipelineSignal::Done(last.clone())).await;
        Ok(last)
    }

    /// Asks the coordinator to skip the remaining stages of `id` and stop
    /// its active stage.
    pub async fn stop(&self, id: &str) -> GridResult<()> {
        self.ctx.pipelines.request_stop(id);
        let msg = PipelineMessage::new(id, PipelineSignal::Stop);
        self.ctx.channel.broadcast(GridMessage::Pipeline(msg)).await?;
        tracing::info!(pipeline = id, node = %self.ctx.node_id(), "Pipeline stop requested");
        Ok(())
    }

    /// Index of the stage being run, or [`NO_ACTIVE_STAGE`].
    pub async fn active_stage(&self, id: &str) -> i64 {
        match self.active_stage.get(id).await {
            Ok(Some(index)) => index,
            Ok(None) => NO_ACTIVE_STAGE,
            Err(e) => {
                tracing::warn!(pipeline = id, error = %e, "Unreadable active stage");
                NO_ACTIVE_STAGE
            }
        }
    }

    /// Forgets every pipeline's progress. Returns whether anything was present.
    pub(crate) async fn reset(&self) -> bool {
        let active = self.active_stage.clear().await;
        let last = self.last_result.clear().await;
        active || last
    }

    async fn await_done(&self, id: &str) -> Option<ExecutionResult> {
        tracing::info!(pipeline = id, node = %self.ctx.node_id(), "Waiting for coordinator to finish pipeline");
        let rx = self.ctx.pipelines.subscribe_done(id);
        tokio::select! {
            received = rx => received.unwrap_or_else(|_| Some(ExecutionResult::failed(INTERRUPTED))),
            _ = self.ctx.scheduler.token().cancelled() => {
                tracing::warn!(pipeline = id, node = %self.ctx.node_id(), "Wait for pipeline interrupted");
                Some(ExecutionResult::failed(INTERRUPTED))
            }
        }
    }

    async fn run_stages(&self, pipeline: &Pipeline) -> GridResult<Option<ExecutionResult>> {
        let id = pipeline.id();
        let start = self.starting_stage(id).await?;
        let mut last = self.last_result.get(id).await?;
        let mut failed = false;
        let mut stopped = false;

        for (index, stage) in (0_i64..).zip(&pipeline.stages) {
            stopped = stopped || self.ctx.pipelines.take_stop(id);
            if index < start {
                tracing::debug!(pipeline = id, stage = index, "Stage done in an earlier run, skipping");
                continue;
            }
            if stopped {
                tracing::info!(pipeline = id, stage = index, "Pipeline stopped, skipping stage");
                continue;
            }
            if failed && !stage.always {
                tracing::info!(pipeline = id, stage = index, "Earlier stage failed, skipping stage");
                continue;
            }
            let Some(request) = (stage.provider)(last.as_ref()) else {
                tracing::info!(pipeline = id, stage = index, "Stage condition not met, skipping stage");
                continue;
            };
            if request.once && self.task_store.terminated(&request.id).await?.is_some() {
                tracing::info!(pipeline = id, stage = index, task = %request.id, "Stage task already ran in this session, skipping");
                continue;
            }

            self.active_stage.put(id, &index).await?;
            let result = self.run_stage(id, request, &mut stopped).await?;
            if self.ctx.scheduler.is_shut_down() {
                return Err(GridError::Shutdown);
            }
            if result.state != TaskState::Completed {
                failed = true;
                tracing::error!(pipeline = id, stage = index, error = ?result.error, "Pipeline stage failed");
            }
            self.last_result.put(id, &result).await?;
            last = Some(result);
        }

        self.active_stage.put(id, &NO_ACTIVE_STAGE).await?;
        self.last_result.remove(id).await;
        tracing::info!(pipeline = id, failed, stopped, "Pipeline finished");
        Ok(last)
    }

    async fn run_stage(&self, id: &str, request: TaskRequest, stopped: &mut bool) -> GridResult<ExecutionResult> {
        let task_id = request.id.clone();
        let run = self.tasks.execute(request);
        tokio::pin!(run);
        tokio::select! {
            result = &mut run => result,
            () = self.ctx.pipelines.stopped(id) => {
                *stopped = true;
                tracing::info!(pipeline = id, task = %task_id, "Pipeline stop requested, stopping active stage");
                if let Err(e) = self.ctx.request_stop(task_id.as_str()).await {
                    tracing::warn!(pipeline = id, task = %task_id, error = %e, "Could not broadcast stage stop");
                }
                run.await
            }
        }
    }

    async fn starting_stage(&self, id: &str) -> GridResult<i64> {
        Ok(match self.active_stage.get(id).await? {
            Some(index) if index > 0 => {
                tracing::info!(pipeline = id, stage = index, "Unterminated pipeline run found, resuming");
                index
            }
            Some(NO_ACTIVE_STAGE) => {
                tracing::info!(pipeline = id, "Pipeline ran before, starting it again");
                0
            }
            _ => 0,
        })
    }

    async fn broadcast(&self, id: &str, signal: PipelineSignal) {
        let msg = GridMessage::Pipeline(PipelineMessage::new(id, signal));
        if let Err(e) = self.ctx.channel.broadcast(msg).await {
            tracing::warn!(pipeline = id, error = %e, "Could not broadcast pipeline signal");
        }
    }
}
