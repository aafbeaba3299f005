//! Handler trait - Task を実行する Handler の定義
//!
//! # 学習ポイント
//! - ジェネリック trait (Handler<T>)
//! - Object-safe trait (DynHandler)
//! - Type erasure パターン (TypedHandler<T, H> → DynHandler)

use std::marker::PhantomData;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::task::Task;
use crate::domain::{NodeId, TaskId, WorkError};

/// What a handler knows about the run it is part of.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_id: TaskId,
    pub node: NodeId,
    /// Cancelled by a stop request, an orphaned request or node shutdown.
    pub stop: CancellationToken,
}

/// Handler は Task を実行して opaque な結果（JSON）を返す
///
/// # 使用例
/// ```ignore
/// struct ReindexHandler;
///
/// #[async_trait]
/// impl Handler<Reindex> for ReindexHandler {
///     async fn handle(&self, task: Reindex, ctx: TaskContext) -> Result<Value, WorkError> {
///         Ok(json!({ "collection": task.collection }))
///     }
/// }
/// ```
#[async_trait]
pub trait Handler<T: Task>: Send + Sync {
    async fn handle(&self, task: T, ctx: TaskContext) -> Result<serde_json::Value, WorkError>;
}

/// DynHandler は object-safe な Handler の抽象化
///
/// `HashMap<String, Arc<dyn DynHandler>>` に格納するための型消去層。
#[async_trait]
pub trait DynHandler: Send + Sync {
    async fn handle_dyn(
        &self,
        payload: serde_json::Value,
        ctx: TaskContext,
    ) -> Result<serde_json::Value, WorkError>;

    fn task_type(&self) -> &str;
}

pub struct TypedHandler<T: Task, H: Handler<T>> {
    handler: H,
    _marker: PhantomData<fn(T)>,
}

impl<T: Task, H: Handler<T>> TypedHandler<T, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T: Task, H: Handler<T>> DynHandler for TypedHandler<T, H> {
    async fn handle_dyn(
        &self,
        payload: serde_json::Value,
        ctx: TaskContext,
    ) -> Result<serde_json::Value, WorkError> {
        let task: T = serde_json::from_value(payload)?;
        self.handler.handle(task, ctx).await
    }

    fn task_type(&self) -> &str {
        T::TYPE
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use crate::typed::task::fixtures::{Echo, Explode, Park};

    pub struct EchoHandler;

    #[async_trait]
    impl Handler<Echo> for EchoHandler {
        async fn handle(&self, task: Echo, ctx: TaskContext) -> Result<serde_json::Value, WorkError> {
            Ok(serde_json::json!({ "echo": task.text, "node": ctx.node.to_string() }))
        }
    }

    pub struct ExplodeHandler;

    #[async_trait]
    impl Handler<Explode> for ExplodeHandler {
        async fn handle(&self, task: Explode, _ctx: TaskContext) -> Result<serde_json::Value, WorkError> {
            Err(WorkError::msg(task.reason))
        }
    }

    pub struct ParkHandler;

    #[async_trait]
    impl Handler<Park> for ParkHandler {
        async fn handle(&self, _task: Park, ctx: TaskContext) -> Result<serde_json::Value, WorkError> {
            ctx.stop.cancelled().await;
            Err(WorkError::Stopped)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::EchoHandler;
    use super::*;
    use crate::typed::task::fixtures::Echo;
    use serde_json::json;

    fn ctx() -> TaskContext {
        TaskContext {
            task_id: TaskId::from("t"),
            node: NodeId::generate(),
            stop: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn typed_handler_decodes_payload() {
        let handler = TypedHandler::<Echo, _>::new(EchoHandler);
        let out = handler.handle_dyn(json!({ "text": "hello" }), ctx()).await.unwrap();
        assert_eq!(out["echo"], "hello");
        assert_eq!(handler.task_type(), Echo::TYPE);
    }

    #[tokio::test]
    async fn bad_payload_is_a_decode_error() {
        let handler = TypedHandler::<Echo, _>::new(EchoHandler);
        let err = handler.handle_dyn(json!({ "nope": 1 }), ctx()).await.unwrap_err();
        assert!(matches!(err, WorkError::Decode(_)));
    }
}
