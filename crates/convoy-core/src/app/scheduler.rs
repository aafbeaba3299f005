//! Scheduler - ノードごとの実行コンテキスト
//!
//! # 学習ポイント
//! - グローバルなスレッドプールの代わりに、ノード単位のコンテキストを
//!   明示的に各コンポーネントへ渡す
//! - CancellationToken: ノード停止（＝待機中の呼び出しへの「割り込み」）
//! - TaskTracker: バックグラウンドタスクの所有と停止待ち
//!
//! 停止の所有者は `GridNode`。`shutdown()` はトークンを cancel し、
//! 追跡中のタスクがすべて終わるまで待つ。

use std::future::Future;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

#[derive(Clone, Default)]
pub struct Scheduler {
    token: CancellationToken,
    tracker: TaskTracker,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Node-wide cancellation token.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// A token cancelled with the node, or earlier on its own.
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    pub fn is_shut_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Spawns a tracked task on the current runtime.
    pub fn spawn<F>(&self, fut: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.tracker.spawn(fut)
    }

    /// Cancels the node token and waits for every tracked task.
    pub async fn shutdown(&self) {
        self.token.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}
