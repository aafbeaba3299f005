//! LocalCluster - 同一プロセス内で動くクラスタ（開発用・テスト用）
//!
//! # 学習ポイント
//! - 1 つの共有状態（メンバー、受信箱、ハンドラ）を Mutex で守る
//! - ロックは await をまたがない（呼び出し対象を集めてからロックを外す）
//! - ハンドラは Weak で保持する（ノード → endpoint → cluster → ノード の循環を切る）
//!
//! # 障害の再現
//! - [`LocalCluster::leave`]: ノードがビューから消える（クラッシュ検知後）
//! - [`LocalCluster::mute`]: ビューには残るが、送受信がすべて落ちる（分断）

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::task::JoinSet;

use crate::domain::{
    GridCommand, GridError, GridMessage, GridReply, GridResult, NodeId, RequestOptions,
    ResponseMode,
};
use crate::ports::{CommandHandler, Delivered, GroupChannel, RemoteDispatcher};

const INBOX_CAPACITY: usize = 256;

#[derive(Default)]
struct ClusterState {
    /// Live view, in join order. The first entry is the coordinator.
    members: Vec<NodeId>,
    handlers: HashMap<NodeId, Weak<dyn CommandHandler>>,
    inboxes: HashMap<NodeId, broadcast::Sender<Delivered>>,
    muted: HashSet<NodeId>,
}

impl ClusterState {
    fn reachable(&self, from: NodeId, to: NodeId) -> bool {
        self.members.contains(&to) && !self.muted.contains(&from) && !self.muted.contains(&to)
    }
}

/// Shared, in-process membership + messaging fabric.
#[derive(Clone, Default)]
pub struct LocalCluster {
    state: Arc<Mutex<ClusterState>>,
}

impl LocalCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ClusterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds a new member and returns its endpoint.
    pub fn join(&self) -> Arc<LocalEndpoint> {
        let id = NodeId::generate();
        let (tx, _) = broadcast::channel(INBOX_CAPACITY);
        let mut state = self.lock();
        state.members.push(id);
        state.inboxes.insert(id, tx);
        tracing::debug!(node = %id, members = state.members.len(), "Node joined local cluster");
        Arc::new(LocalEndpoint {
            id,
            state: Arc::clone(&self.state),
        })
    }

    /// Removes a member from the view.
    pub fn leave(&self, id: NodeId) {
        let mut state = self.lock();
        state.members.retain(|m| *m != id);
        state.handlers.remove(&id);
        state.inboxes.remove(&id);
        state.muted.remove(&id);
        tracing::debug!(node = %id, "Node left local cluster");
    }

    /// Drops every message to and from `id` while keeping it in the view.
    pub fn mute(&self, id: NodeId) {
        self.lock().muted.insert(id);
    }

    pub fn unmute(&self, id: NodeId) {
        self.lock().muted.remove(&id);
    }

    pub fn members(&self) -> Vec<NodeId> {
        self.lock().members.clone()
    }
}

/// One member's view of a [`LocalCluster`].
pub struct LocalEndpoint {
    id: NodeId,
    state: Arc<Mutex<ClusterState>>,
}

impl LocalEndpoint {
    fn lock(&self) -> MutexGuard<'_, ClusterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn resolve(&self, targets: Option<&[NodeId]>) -> Vec<(NodeId, Arc<dyn CommandHandler>)> {
        let state = self.lock();
        let wanted: Vec<NodeId> = match targets {
            Some(t) => t.to_vec(),
            None => state.members.clone(),
        };
        wanted
            .into_iter()
            .filter(|t| *t != self.id && state.reachable(self.id, *t))
            .filter_map(|t| {
                state
                    .handlers
                    .get(&t)
                    .and_then(Weak::upgrade)
                    .map(|h| (t, h))
            })
            .collect()
    }
}

#[async_trait]
impl GroupChannel for LocalEndpoint {
    fn local_address(&self) -> NodeId {
        self.id
    }

    fn coordinator(&self) -> Option<NodeId> {
        self.lock().members.first().copied()
    }

    fn members(&self) -> Vec<NodeId> {
        self.lock().members.clone()
    }

    async fn broadcast(&self, message: GridMessage) -> GridResult<()> {
        let state = self.lock();
        if !state.members.contains(&self.id) {
            return Err(GridError::Transport(format!("{} is not a member", self.id)));
        }
        for member in &state.members {
            if *member == self.id || !state.reachable(self.id, *member) {
                continue;
            }
            if let Some(inbox) = state.inboxes.get(member) {
                // no subscriber on that node yet: the message is simply lost
                let _ = inbox.send(Delivered {
                    from: self.id,
                    message: message.clone(),
                });
            }
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<Delivered> {
        let mut state = self.lock();
        state
            .inboxes
            .entry(self.id)
            .or_insert_with(|| broadcast::channel(INBOX_CAPACITY).0)
            .subscribe()
    }
}

#[async_trait]
impl RemoteDispatcher for LocalEndpoint {
    fn bind(&self, handler: Arc<dyn CommandHandler>) {
        self.lock().handlers.insert(self.id, Arc::downgrade(&handler));
    }

    async fn call_one(&self, to: NodeId, command: GridCommand) -> GridResult<GridReply> {
        let handler = self
            .resolve(Some(&[to]))
            .into_iter()
            .next()
            .map(|(_, h)| h)
            .ok_or_else(|| GridError::Transport(format!("{to} is unreachable")))?;
        Ok(handler.handle(self.id, command).await)
    }

    async fn call_many(
        &self,
        targets: Option<&[NodeId]>,
        command: GridCommand,
        options: RequestOptions,
    ) -> GridResult<HashMap<NodeId, GridReply>> {
        let calls = self.resolve(targets);
        let from = self.id;

        if options.mode == ResponseMode::None {
            for (_, handler) in calls {
                let command = command.clone();
                tokio::spawn(async move {
                    handler.handle(from, command).await;
                });
            }
            return Ok(HashMap::new());
        }

        let mut set = JoinSet::new();
        for (to, handler) in calls {
            let command = command.clone();
            set.spawn(async move { (to, handler.handle(from, command).await) });
        }

        let deadline = tokio::time::Instant::now() + options.timeout;
        let mut replies = HashMap::new();
        loop {
            match tokio::time::timeout_at(deadline, set.join_next()).await {
                Ok(Some(Ok((to, reply)))) => {
                    replies.insert(to, reply);
                    if options.mode == ResponseMode::First {
                        break;
                    }
                }
                Ok(Some(Err(e))) => {
                    tracing::warn!(node = %from, error = %e, "Remote handler did not complete");
                }
                Ok(None) => break,
                Err(_) => {
                    tracing::debug!(node = %from, pending = set.len(), "call_many timed out");
                    break;
                }
            }
        }
        Ok(replies)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{JobState, JobStateAtTime, JobStateMessage, StopMessage};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingHandler {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CommandHandler for CountingHandler {
        async fn handle(&self, _from: NodeId, _command: GridCommand) -> GridReply {
            self.calls.fetch_add(1, Ordering::SeqCst);
            GridReply::Ack
        }
    }

    fn report() -> GridCommand {
        GridCommand::ReportState(JobStateMessage::new(
            "job",
            JobStateAtTime::new(JobState::Running, 1),
        ))
    }

    fn bind_counter(ep: &LocalEndpoint) -> Arc<CountingHandler> {
        let h = Arc::new(CountingHandler {
            calls: AtomicUsize::new(0),
        });
        ep.bind(h.clone());
        h
    }

    #[test]
    fn first_member_is_coordinator() {
        let cluster = LocalCluster::new();
        let a = cluster.join();
        let b = cluster.join();
        assert!(a.is_coordinator());
        assert!(!b.is_coordinator());
        assert_eq!(b.coordinator(), Some(a.local_address()));

        cluster.leave(a.local_address());
        assert!(b.is_coordinator());
    }

    #[tokio::test]
    async fn call_many_collects_replies_from_everyone_else() {
        let cluster = LocalCluster::new();
        let a = cluster.join();
        let b = cluster.join();
        let c = cluster.join();
        let ha = bind_counter(&a);
        let hb = bind_counter(&b);
        let hc = bind_counter(&c);

        let replies = a
            .call_many(None, report(), RequestOptions::wait_all(Duration::from_secs(1)))
            .await
            .unwrap();

        assert_eq!(replies.len(), 2);
        assert_eq!(ha.calls.load(Ordering::SeqCst), 0);
        assert_eq!(hb.calls.load(Ordering::SeqCst), 1);
        assert_eq!(hc.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn muted_node_neither_sends_nor_receives() {
        let cluster = LocalCluster::new();
        let a = cluster.join();
        let b = cluster.join();
        let _ha = bind_counter(&a);
        let hb = bind_counter(&b);

        cluster.mute(b.local_address());

        let replies = a
            .call_many(None, report(), RequestOptions::wait_all(Duration::from_millis(200)))
            .await
            .unwrap();
        assert!(replies.is_empty());
        assert_eq!(hb.calls.load(Ordering::SeqCst), 0);
        assert!(b.call_one(a.local_address(), report()).await.is_err());
        // still part of the view
        assert_eq!(a.members().len(), 2);
    }

    #[tokio::test]
    async fn broadcast_reaches_subscribers_only_on_other_nodes() {
        let cluster = LocalCluster::new();
        let a = cluster.join();
        let b = cluster.join();
        let mut rx_a = a.subscribe();
        let mut rx_b = b.subscribe();

        let msg = GridMessage::Stop(StopMessage {
            job_name: "crawl".into(),
        });
        a.broadcast(msg.clone()).await.unwrap();

        let got = rx_b.recv().await.unwrap();
        assert_eq!(got.from, a.local_address());
        assert_eq!(got.message, msg);
        assert!(rx_a.try_recv().is_err());
    }
}
