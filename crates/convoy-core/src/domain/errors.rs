//! Errors - エラー型と分類
//!
//! # 分類
//! - [`GridError`]: 調整レイヤーの障害（送信失敗、シリアライズ失敗、設定不正など）。
//!   呼び出し側がジョブを再実行しても回復できないものだけをここに置く。
//! - [`WorkError`]: ジョブ/タスク本体の失敗。dispatcher の呼び出し側へは
//!   伝播せず、FAILED 状態 + エラーメッセージとして表現される。

use crate::domain::ids::TaskId;
use crate::typed::RegistryError;

/// Coordination-layer fault.
#[derive(Debug, thiserror::Error)]
pub enum GridError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("task request {0} is already outstanding")]
    DuplicateTask(TaskId),

    #[error("only the coordinator can {0}")]
    NotCoordinator(&'static str),

    #[error("invalid pipeline {0}: {1}")]
    InvalidPipeline(String, &'static str),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("node is shut down")]
    Shutdown,
}

/// Failure of a job or task body.
#[derive(Debug, thiserror::Error)]
pub enum WorkError {
    #[error("{0}")]
    Failed(String),

    #[error("payload decode: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("stopped on request")]
    Stopped,
}

impl WorkError {
    pub fn msg(message: impl Into<String>) -> Self {
        WorkError::Failed(message.into())
    }
}

impl From<String> for WorkError {
    fn from(message: String) -> Self {
        WorkError::Failed(message)
    }
}

impl From<&str> for WorkError {
    fn from(message: &str) -> Self {
        WorkError::Failed(message.to_string())
    }
}

pub type GridResult<T> = Result<T, GridError>;
