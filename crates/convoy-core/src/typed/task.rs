//! Task trait - 型付き Task の定義
//!
//! # 学習ポイント
//! - Associated Constants (`const TYPE`)
//! - Trait bounds の組み合わせ (Serialize + DeserializeOwned + Send + Sync + 'static)

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::domain::{Aggregation, ExecutionMode, GridResult, TaskId, TaskRequest};

/// Task は task_type と payload の型を対応付ける
///
/// # 使用例
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct Reindex {
///     collection: String,
/// }
///
/// impl Task for Reindex {
///     const TYPE: &'static str = "search.index.rebuild.v1";
/// }
/// ```
///
/// # Trait Bounds
/// - `Serialize`: TaskRequest の payload に載せるため
/// - `DeserializeOwned`: ワーカー側で payload から復元するため
/// - `Send + Sync + 'static`: 別タスクで実行するため
pub trait Task: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// task_type の定義
    ///
    /// # 命名規約
    /// - `{namespace}.{domain}.{action}.v{major}`
    const TYPE: &'static str;

    /// How ALL_NODES results of this task are folded into one.
    const AGGREGATION: Aggregation = Aggregation::AnyCompleted;

    /// Wraps `self` into a request record for the shared store.
    fn into_request(
        self,
        id: impl Into<TaskId>,
        mode: ExecutionMode,
    ) -> GridResult<TaskRequest> {
        let payload = serde_json::to_value(&self)?;
        Ok(TaskRequest::new(id, mode, Self::TYPE, payload).with_aggregation(Self::AGGREGATION))
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use serde::{Deserialize, Serialize};

    use super::Task;
    use crate::domain::Aggregation;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct Echo {
        pub text: String,
    }

    impl Task for Echo {
        const TYPE: &'static str = "test.echo.v1";
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct Explode {
        pub reason: String,
    }

    impl Task for Explode {
        const TYPE: &'static str = "test.explode.v1";
        const AGGREGATION: Aggregation = Aggregation::AllCompleted;
    }

    /// Runs until stopped.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct Park {}

    impl Task for Park {
        const TYPE: &'static str = "test.park.v1";
    }
}
