//! convoy デモ: プロセス内 3 ノードクラスタで各ポリシーを一通り動かす
//!
//! ```text
//! RUST_LOG=convoy_core=debug cargo run -p convoy-cli -- [config.json]
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::{Duration, sleep};
use tracing_subscriber::EnvFilter;

use convoy_core::domain::ExecutionMode;
use convoy_core::impls::{InMemoryGridStore, LocalCluster};
use convoy_core::typed::{Handler, Task, TaskContext};
use convoy_core::{GridConfig, GridNode, GridNodeBuilder, Pipeline, Stage, WorkError};

#[derive(Debug, Serialize, Deserialize)]
struct Greet {
    name: String,
}

impl Task for Greet {
    const TYPE: &'static str = "demo.greet.v1";
}

struct GreetHandler;

#[async_trait]
impl Handler<Greet> for GreetHandler {
    async fn handle(&self, task: Greet, ctx: TaskContext) -> Result<serde_json::Value, WorkError> {
        sleep(Duration::from_millis(100)).await;
        tracing::info!(node = %ctx.node, task = %ctx.task_id, "Hello, {}!", task.name);
        Ok(serde_json::json!({ "greeted": task.name, "by": ctx.node.to_string() }))
    }
}

fn load_config() -> Result<GridConfig, Box<dyn std::error::Error>> {
    let config = match std::env::args().nth(1) {
        Some(path) => GridConfig::from_file(path)?,
        // demo pace: short polls so the run ends in a few seconds
        None => GridConfig {
            task_poll_interval_ms: 200,
            task_progress_poll_interval_ms: 100,
            ..GridConfig::default()
        },
    };
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // (A) クラスタ（メンバーシップ + メッセージング）と共有ストアを用意
    let config = load_config()?;
    let cluster = LocalCluster::new();
    let store = Arc::new(InMemoryGridStore::new());
    let mut nodes: Vec<GridNode> = Vec::new();
    for _ in 0..3 {
        let node = GridNodeBuilder::new()
            .config(config.clone())
            .store(store.clone())
            .endpoint(cluster.join())
            .register::<Greet, _>(GreetHandler)?
            .expect_tasks(&[Greet::TYPE])
            .build()?;
        nodes.push(node);
    }

    // (B) single-node + once: 3 ノードが同時に呼んでも本体は 1 回だけ
    let builds = Arc::new(AtomicU32::new(0));
    for round in 1..=2 {
        let mut calls = Vec::new();
        for node in &nodes {
            let compute = node.compute().clone();
            let builds = Arc::clone(&builds);
            calls.push(tokio::spawn(async move {
                compute
                    .run_on_one_once("indexBuild", move |_stop| async move {
                        builds.fetch_add(1, Ordering::SeqCst);
                        sleep(Duration::from_millis(300)).await;
                        Ok(())
                    })
                    .await
            }));
        }
        for call in calls {
            let state = call.await??;
            tracing::info!(round, %state, "indexBuild returned");
        }
    }
    tracing::info!(runs = builds.load(Ordering::SeqCst), "indexBuild body executions");

    // (C) all-node: 全ノードが自分の分を実行し、集約結果が全員に返る
    let mut calls = Vec::new();
    for node in &nodes {
        let compute = node.compute().clone();
        calls.push(tokio::spawn(async move {
            let me = compute.node_id();
            compute
                .run_on_all("warmCache", move |_stop| async move {
                    tracing::info!(node = %me, "Warming cache");
                    sleep(Duration::from_millis(200)).await;
                    Ok(())
                })
                .await
        }));
    }
    for call in calls {
        let state = call.await??;
        tracing::info!(%state, "warmCache returned");
    }

    // (D) タスクキュー: 全ノードのワーカーが ALL_NODES のタスクを実行
    for node in &nodes {
        node.worker().start();
    }
    let request = Greet { name: "convoy".into() }.into_request("greet-1", ExecutionMode::AllNodes)?;
    let result = nodes[0].tasks().execute(request).await?;
    tracing::info!(state = ?result.state, result = ?result.result, "Task finished");

    // (D') パイプライン: 前段の結果から次段のタスクを作る。全ノードが結果を受け取る
    let greeting = || -> Result<Pipeline, Box<dyn std::error::Error>> {
        let first = Greet { name: "stage one".into() }.into_request("greet-stage-1", ExecutionMode::AllNodes)?;
        Ok(Pipeline::new(
            "greetings",
            vec![
                Stage::task(first),
                Stage::from_fn(|last| {
                    let by = last?.result.as_ref()?["by"].as_str()?.to_string();
                    Greet { name: by }
                        .into_request("greet-stage-2", ExecutionMode::SingleNode)
                        .ok()
                }),
            ],
        ))
    };
    let mut calls = Vec::new();
    for node in &nodes {
        let compute = node.compute().clone();
        let pipeline = greeting()?;
        calls.push(tokio::spawn(async move { compute.execute_pipeline(&pipeline).await }));
    }
    for call in calls {
        let last = call.await??;
        tracing::info!(last = ?last.map(|r| r.result), "greetings pipeline returned");
    }

    for node in &nodes {
        let status = serde_json::to_string(&node.status().await)?;
        tracing::info!(%status, "Node status");
    }

    // (E) 停止: ワーカーを止め、バックグラウンド処理の終了を待つ
    for node in &nodes {
        node.shutdown().await;
    }
    Ok(())
}
