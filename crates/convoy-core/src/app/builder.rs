//! GridNodeBuilder - 1 ノードの構築とワイヤリング
//!
//! # 学習ポイント
//! - Builder パターンで ports（store / channel / dispatcher / clock）を差し込む
//! - 起動時検証（Fail-fast 設計）: 設定値と、期待するタスクハンドラの揃い
//! - 構築後は `GridNode` が停止（shutdown）の所有者になる
//!
//! # 使用例
//! ```ignore
//! let cluster = LocalCluster::new();
//! let store = Arc::new(InMemoryGridStore::new());
//! let node = GridNodeBuilder::new()
//!     .config(GridConfig::from_file("grid.json")?)
//!     .store(store.clone())
//!     .endpoint(cluster.join())
//!     .register::<Reindex, _>(ReindexHandler)?
//!     .expect_tasks(&["search.index.rebuild.v1"])
//!     .build()?;
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::app::compute::GridCompute;
use crate::app::config::GridConfig;
use crate::app::context::NodeContext;
use crate::app::job_store::JobStateStore;
use crate::app::pipeline::PipelineCoordinator;
use crate::app::scheduler::Scheduler;
use crate::app::status::NodeStatus;
use crate::app::task_coordinator::TaskCoordinator;
use crate::app::task_store::TaskStoreManager;
use crate::app::worker_loop::TaskWorker;
use crate::domain::{GridError, NodeId};
use crate::ports::{Clock, CommandHandler, GridStore, GroupChannel, MonotonicStamp, RemoteDispatcher, SystemClock};
use crate::typed::{Handler, RegistryError, Task, TypedRegistry};

/// BuildError はノード構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Missing task types: {0:?}. These tasks were expected but not registered.")]
    MissingTaskTypes(Vec<String>),

    #[error("no {0} was provided")]
    MissingPort(&'static str),

    #[error(transparent)]
    Grid(#[from] GridError),
}

pub struct GridNodeBuilder {
    config: GridConfig,
    store: Option<Arc<dyn GridStore>>,
    channel: Option<Arc<dyn GroupChannel>>,
    dispatcher: Option<Arc<dyn RemoteDispatcher>>,
    clock: Arc<dyn Clock>,
    registry: TypedRegistry,
    expected_tasks: Option<Vec<String>>,
}

impl GridNodeBuilder {
    pub fn new() -> Self {
        Self {
            config: GridConfig::default(),
            store: None,
            channel: None,
            dispatcher: None,
            clock: Arc::new(SystemClock),
            registry: TypedRegistry::new(),
            expected_tasks: None,
        }
    }

    pub fn config(mut self, config: GridConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(mut self, store: Arc<dyn GridStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn channel(mut self, channel: Arc<dyn GroupChannel>) -> Self {
        self.channel = Some(channel);
        self
    }

    pub fn dispatcher(mut self, dispatcher: Arc<dyn RemoteDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Uses one object as both group channel and dispatcher.
    pub fn endpoint<E>(self, endpoint: Arc<E>) -> Self
    where
        E: GroupChannel + RemoteDispatcher + 'static,
    {
        let channel: Arc<dyn GroupChannel> = endpoint.clone();
        let dispatcher: Arc<dyn RemoteDispatcher> = endpoint;
        self.channel(channel).dispatcher(dispatcher)
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Handler を登録
    pub fn register<T: Task, H: Handler<T> + 'static>(
        mut self,
        handler: H,
    ) -> Result<Self, RegistryError> {
        self.registry.register::<T, H>(handler)?;
        Ok(self)
    }

    /// 期待される task_type のリストを設定
    pub fn expect_tasks(mut self, task_types: &[&str]) -> Self {
        self.expected_tasks = Some(task_types.iter().map(|t| t.to_string()).collect());
        self
    }

    /// Validates everything and starts the node's message pump.
    ///
    /// Must be called inside a tokio runtime.
    pub fn build(self) -> Result<GridNode, BuildError> {
        self.config.validate()?;
        if let Some(expected) = &self.expected_tasks {
            let registered = self.registry.registered_types();
            let missing: Vec<String> = expected
                .iter()
                .filter(|t| !registered.contains(t))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingTaskTypes(missing));
            }
        }
        let store = self.store.ok_or(BuildError::MissingPort("grid store"))?;
        let channel = self.channel.ok_or(BuildError::MissingPort("group channel"))?;
        let dispatcher = self.dispatcher.ok_or(BuildError::MissingPort("remote dispatcher"))?;

        let stamp = Arc::new(MonotonicStamp::new());
        let job_states = JobStateStore::new(store.as_ref(), Arc::clone(&self.clock), Arc::clone(&stamp));
        let ctx = NodeContext::new(
            self.config,
            Scheduler::new(),
            channel,
            Arc::clone(&dispatcher),
            self.clock,
            stamp,
            job_states,
        );
        let handler: Arc<dyn CommandHandler> = ctx.clone();
        dispatcher.bind(handler);
        ctx.start_message_pump();

        let task_store = TaskStoreManager::new(store.as_ref());
        let registry = Arc::new(self.registry);
        let worker = TaskWorker::new(Arc::clone(&ctx), task_store.clone(), Arc::clone(&registry));
        let tasks = TaskCoordinator::new(Arc::clone(&ctx), task_store.clone());
        let pipelines = PipelineCoordinator::new(Arc::clone(&ctx), store.as_ref(), tasks.clone(), task_store.clone());
        let compute = GridCompute::new(Arc::clone(&ctx), task_store, worker.clone(), pipelines);

        tracing::info!(
            node = %ctx.node_id(),
            coordinator = ctx.is_coordinator(),
            task_types = ?registry.registered_types(),
            "Grid node started"
        );
        Ok(GridNode {
            ctx,
            compute,
            tasks,
            worker,
            registry,
        })
    }
}

impl Default for GridNodeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A running node: job API, task API and the owner of its background work.
pub struct GridNode {
    ctx: Arc<NodeContext>,
    compute: GridCompute,
    tasks: TaskCoordinator,
    worker: TaskWorker,
    registry: Arc<TypedRegistry>,
}

impl GridNode {
    pub fn id(&self) -> NodeId {
        self.ctx.node_id()
    }

    pub fn compute(&self) -> &GridCompute {
        &self.compute
    }

    pub fn tasks(&self) -> &TaskCoordinator {
        &self.tasks
    }

    pub fn worker(&self) -> &TaskWorker {
        &self.worker
    }

    pub fn registered_task_types(&self) -> Vec<String> {
        self.registry.registered_types()
    }

    pub async fn status(&self) -> NodeStatus {
        let running_jobs: BTreeMap<_, _> = self.compute.running_jobs().await.into_iter().collect();
        NodeStatus {
            node: self.ctx.node_id(),
            coordinator: self.ctx.channel.coordinator(),
            members: self.ctx.channel.members().len(),
            running_jobs,
            worker: self.worker.status(),
        }
    }

    /// Stops the task loop, interrupts every waiting call and waits for the
    /// node's background work to end.
    pub async fn shutdown(&self) {
        self.worker.stop();
        self.ctx.scheduler.shutdown().await;
        tracing::info!(node = %self.ctx.node_id(), "Grid node stopped");
    }
}
