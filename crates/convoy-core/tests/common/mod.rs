//! In-process cluster harness shared by the scenario tests.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use convoy_core::impls::{InMemoryGridStore, LocalCluster};
use convoy_core::typed::{Handler, Task, TaskContext};
use convoy_core::{GridConfig, GridNode, GridNodeBuilder, WorkError};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

/// Timeouts short enough for a test, long enough for a loaded CI box.
pub fn fast_config() -> GridConfig {
    GridConfig {
        tick_interval_ms: 10,
        max_notify_interval_ms: 100,
        node_stale_timeout_ms: 400,
        barrier_recheck_interval_ms: 20,
        task_poll_interval_ms: 20,
        inactive_coord_timeout_ms: 5_000,
        dispatch_timeout_ms: 200,
        task_progress_poll_interval_ms: 20,
        ..GridConfig::default()
    }
}

pub struct TestCluster {
    pub net: LocalCluster,
    pub store: Arc<InMemoryGridStore>,
    pub nodes: Vec<GridNode>,
}

impl TestCluster {
    pub fn start(size: usize, config: GridConfig) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
        let net = LocalCluster::new();
        let store = Arc::new(InMemoryGridStore::new());
        let nodes = (0..size)
            .map(|_| {
                GridNodeBuilder::new()
                    .config(config.clone())
                    .store(store.clone())
                    .endpoint(net.join())
                    .register::<Shout, _>(ShoutHandler)
                    .unwrap()
                    .register::<Fail, _>(FailHandler)
                    .unwrap()
                    .register::<Nap, _>(NapHandler)
                    .unwrap()
                    .expect_tasks(&[Shout::TYPE, Fail::TYPE, Nap::TYPE])
                    .build()
                    .unwrap()
            })
            .collect();
        Self { net, store, nodes }
    }

    pub fn coordinator(&self) -> &GridNode {
        &self.nodes[0]
    }

    pub async fn shutdown(&self) {
        for node in &self.nodes {
            node.shutdown().await;
        }
    }
}

/// Fails the test instead of hanging it.
pub async fn within<F: Future>(fut: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(10), fut)
        .await
        .expect("scenario did not finish in time")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Shout {
    pub text: String,
}

impl Task for Shout {
    const TYPE: &'static str = "demo.shout.v1";
}

pub struct ShoutHandler;

#[async_trait]
impl Handler<Shout> for ShoutHandler {
    async fn handle(&self, task: Shout, ctx: TaskContext) -> Result<serde_json::Value, WorkError> {
        Ok(serde_json::json!({
            "text": task.text.to_uppercase(),
            "node": ctx.node.to_string(),
        }))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fail {
    pub reason: String,
}

impl Task for Fail {
    const TYPE: &'static str = "demo.fail.v1";
}

pub struct FailHandler;

#[async_trait]
impl Handler<Fail> for FailHandler {
    async fn handle(&self, task: Fail, _ctx: TaskContext) -> Result<serde_json::Value, WorkError> {
        Err(WorkError::msg(task.reason))
    }
}

/// Sleeps for `millis` unless stopped first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Nap {
    pub millis: u64,
}

impl Task for Nap {
    const TYPE: &'static str = "demo.nap.v1";
}

pub struct NapHandler;

#[async_trait]
impl Handler<Nap> for NapHandler {
    async fn handle(&self, task: Nap, ctx: TaskContext) -> Result<serde_json::Value, WorkError> {
        tokio::select! {
            _ = ctx.stop.cancelled() => Err(WorkError::msg("stopped")),
            _ = tokio::time::sleep(Duration::from_millis(task.millis)) => {
                Ok(serde_json::json!({ "slept": task.millis }))
            }
        }
    }
}
