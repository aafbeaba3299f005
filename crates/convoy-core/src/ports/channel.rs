//! GroupChannel port - グループ通信レイヤー
//!
//! 提供するもの:
//! - 現在のクラスタメンバー（不透明なノードアドレスの集合）
//! - 自ノードのアドレス、coordinator のアドレス
//! - 非保証のブロードキャストと、その購読
//!
//! 配送保証はない。終了通知のように落としてはいけないものは
//! [`crate::app::notifier`] で再送する。

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::domain::{GridMessage, GridResult, NodeId};

/// A message as received from the channel, with its sender.
#[derive(Debug, Clone)]
pub struct Delivered {
    pub from: NodeId,
    pub message: GridMessage,
}

#[async_trait]
pub trait GroupChannel: Send + Sync {
    fn local_address(&self) -> NodeId;

    /// Current coordinator, if the view is not empty.
    fn coordinator(&self) -> Option<NodeId>;

    /// Current live membership view (includes the local node).
    fn members(&self) -> Vec<NodeId>;

    fn is_coordinator(&self) -> bool {
        self.coordinator() == Some(self.local_address())
    }

    /// Best-effort send to every other member.
    async fn broadcast(&self, message: GridMessage) -> GridResult<()>;

    /// Messages broadcast by other members from now on.
    fn subscribe(&self) -> broadcast::Receiver<Delivered>;
}
