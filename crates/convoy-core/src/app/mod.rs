//! App - アプリケーション層
//!
//! ports を組み合わせて、ジョブ実行ポリシーとタスクループを実装します。
//!
//! # 主要コンポーネント
//! - **GridNodeBuilder / GridNode**: ノードの構築とワイヤリング、停止の所有
//! - **GridCompute**: ジョブ実行 API（single-node / all-node、run-once、stop、session reset）
//! - **JobStateStore**: 共有ストア上のジョブ正規状態
//! - **ReliableNotifier**: ack されるまで再送する汎用プロトコル
//! - **ObservationLog**: all-node バリアのハートビート集約
//! - **TaskCoordinator / TaskWorker**: タスク要求の投入・集約と、各ノードのポーリング実行
//! - **PipelineCoordinator**: 順序付きステージをタスクとして実行し、途中から再開する

pub mod board;
pub mod builder;
pub mod compute;
pub mod config;
pub(crate) mod context;
pub mod heartbeat;
pub mod job_store;
pub mod notifier;
pub mod pipeline;
pub mod policy;
pub mod scheduler;
pub mod status;
pub mod stop;
pub mod task_coordinator;
pub mod task_store;
pub mod worker_loop;

// 主要な型を再エクスポート
pub use self::builder::{BuildError, GridNode, GridNodeBuilder};
pub use self::compute::GridCompute;
pub use self::config::GridConfig;
pub use self::heartbeat::{Aggregate, Observation, compute_aggregate};
pub use self::job_store::JobStateStore;
pub use self::notifier::{NotifierConfig, NotifyOutcome, ReliableNotifier};
pub use self::pipeline::{Pipeline, PipelineCoordinator, Stage};
pub use self::policy::{RunPolicy, Work, WorkFuture, node_job_name};
pub use self::scheduler::Scheduler;
pub use self::status::{NodeStatus, WorkerStatus};
pub use self::task_coordinator::{TaskCoordinator, aggregate_progress};
pub use self::worker_loop::TaskWorker;
