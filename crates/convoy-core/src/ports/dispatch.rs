//! RemoteDispatcher port - ノード間のリモート呼び出し
//!
//! # 設計
//! - コマンドは型付き enum（[`GridCommand`]）。汎用の dispatch 関数に渡す
//! - 応答モード（待たない / 1 件待つ / 全件をタイムアウト付きで待つ）は
//!   [`RequestOptions`] で明示的に指定する
//! - 受信側は [`CommandHandler`] を `bind` しておく

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::{GridCommand, GridReply, GridResult, NodeId, RequestOptions};

/// Server side of the dispatcher: executes commands sent by other nodes.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, from: NodeId, command: GridCommand) -> GridReply;
}

#[async_trait]
pub trait RemoteDispatcher: Send + Sync {
    /// Registers the local handler. A later call replaces the previous one.
    fn bind(&self, handler: Arc<dyn CommandHandler>);

    /// Request/response call to a single node.
    async fn call_one(&self, to: NodeId, command: GridCommand) -> GridResult<GridReply>;

    /// Calls several nodes (`None` = every member except the caller).
    ///
    /// The returned map only holds replies that arrived under the given
    /// options; it is always empty for [`crate::domain::ResponseMode::None`].
    async fn call_many(
        &self,
        targets: Option<&[NodeId]>,
        command: GridCommand,
        options: RequestOptions,
    ) -> GridResult<HashMap<NodeId, GridReply>>;
}
