//! NodeContext - 1 ノード分の協調状態と通信の結び目
//!
//! # 学習ポイント
//! - ports（GroupChannel / RemoteDispatcher / GridStore / Clock）を 1 か所に集め、
//!   ポリシーやタスクループへは `Arc<NodeContext>` だけを渡す
//! - `CommandHandler` を実装してリモート呼び出し（ReportState）を受ける
//! - ブロードキャスト（Stop / JobState / Pipeline）は message pump が受けて振り分ける
//!
//! # ReportState の扱い
//! - 自分が coordinator: ハートビートとして ObservationLog に記録 → Ack
//!   （バリアが開いていないジョブの報告は捨てて Ignored。送り手は再送する）
//! - coordinator から届いた終端状態: TerminalBoard に載せる → Ack
//! - それ以外: Ignored

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::broadcast::error::RecvError;

use crate::app::board::TerminalBoard;
use crate::app::config::GridConfig;
use crate::app::heartbeat::ObservationLog;
use crate::app::job_store::JobStateStore;
use crate::app::notifier::{NotifierConfig, ReliableNotifier};
use crate::app::pipeline::PipelineSignals;
use crate::app::scheduler::Scheduler;
use crate::app::stop::StopRegistry;
use crate::domain::{
    GridCommand, GridMessage, GridReply, GridResult, JobState, JobStateAtTime, JobStateMessage,
    NodeId, PipelineSignal, RequestOptions, StopMessage,
};
use crate::ports::{Clock, CommandHandler, Delivered, GroupChannel, MonotonicStamp, RemoteDispatcher};

pub(crate) struct NodeContext {
    pub(crate) config: GridConfig,
    pub(crate) scheduler: Scheduler,
    pub(crate) channel: Arc<dyn GroupChannel>,
    pub(crate) dispatcher: Arc<dyn RemoteDispatcher>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) stamp: Arc<MonotonicStamp>,
    pub(crate) job_states: JobStateStore,
    pub(crate) observations: ObservationLog,
    pub(crate) board: TerminalBoard,
    pub(crate) stops: StopRegistry,
    pub(crate) pipelines: PipelineSignals,
    claims: Arc<Mutex<HashSet<String>>>,
}

impl NodeContext {
    pub(crate) fn new(
        config: GridConfig,
        scheduler: Scheduler,
        channel: Arc<dyn GroupChannel>,
        dispatcher: Arc<dyn RemoteDispatcher>,
        clock: Arc<dyn Clock>,
        stamp: Arc<MonotonicStamp>,
        job_states: JobStateStore,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            scheduler,
            channel,
            dispatcher,
            clock,
            stamp,
            job_states,
            observations: ObservationLog::new(),
            board: TerminalBoard::new(),
            stops: StopRegistry::new(),
            pipelines: PipelineSignals::default(),
            claims: Arc::default(),
        })
    }

    pub(crate) fn node_id(&self) -> NodeId {
        self.channel.local_address()
    }

    pub(crate) fn is_coordinator(&self) -> bool {
        self.channel.is_coordinator()
    }

    pub(crate) fn now_millis(&self) -> i64 {
        self.stamp.next(self.clock.as_ref())
    }

    pub(crate) fn stamped(&self, state: JobState) -> JobStateAtTime {
        JobStateAtTime::new(state, self.now_millis())
    }

    /// Claims the local right to drive `job` as coordinator.
    ///
    /// `None` when another call on this node already drives it.
    pub(crate) fn try_claim(&self, job: &str) -> Option<ClaimGuard> {
        let mut claims = lock(&self.claims);
        if !claims.insert(job.to_string()) {
            return None;
        }
        Some(ClaimGuard {
            claims: Arc::clone(&self.claims),
            job: job.to_string(),
        })
    }

    /// Stops `name` here and asks every other node to do the same.
    ///
    /// Returns how many bodies were stopped on this node.
    pub(crate) async fn request_stop(&self, name: &str) -> GridResult<usize> {
        let local = self.stops.stop(name);
        self.channel
            .broadcast(GridMessage::Stop(StopMessage {
                job_name: name.to_string(),
            }))
            .await?;
        tracing::info!(name, node = %self.node_id(), local, "Stop broadcast");
        Ok(local)
    }

    /// Best-effort "a new run of `job` started" broadcast.
    pub(crate) async fn announce_started(&self, job: &str, at: JobStateAtTime) {
        self.board.discard_older(job, at.timestamp_millis);
        let msg = GridMessage::JobState(JobStateMessage::new(job, at));
        if let Err(e) = self.channel.broadcast(msg).await {
            tracing::warn!(job, error = %e, "Could not broadcast job start");
        }
    }

    /// Delivers the canonical terminal state of `job` to every other member,
    /// retrying until each of them acknowledged it.
    pub(crate) fn announce_terminal(self: &Arc<Self>, job: &str, at: JobStateAtTime) -> ReliableNotifier {
        self.board.publish(job, at);

        let acked: Arc<Mutex<HashSet<NodeId>>> = Arc::default();
        let delivered = Arc::new(AtomicBool::new(false));
        let ctx = Arc::clone(self);
        let job_name = job.to_string();
        let pending_flag = Arc::clone(&delivered);

        let notify = move || {
            let ctx = Arc::clone(&ctx);
            let acked = Arc::clone(&acked);
            let delivered = Arc::clone(&delivered);
            let command = GridCommand::ReportState(JobStateMessage::new(job_name.clone(), at));
            async move {
                let me = ctx.node_id();
                let targets: Vec<NodeId> = {
                    let acked = lock(&acked);
                    ctx.channel
                        .members()
                        .into_iter()
                        .filter(|m| *m != me && !acked.contains(m))
                        .collect()
                };
                if !targets.is_empty() {
                    let options = RequestOptions::wait_all(ctx.config.dispatch_timeout());
                    match ctx.dispatcher.call_many(Some(&targets), command, options).await {
                        Ok(replies) => record_acks(&acked, &replies),
                        Err(e) => tracing::debug!(error = %e, "Terminal announcement not sent"),
                    }
                }
                let acked = lock(&acked);
                let all = ctx.channel.members().iter().all(|m| *m == me || acked.contains(m));
                delivered.store(all, Ordering::SeqCst);
                all
            }
        };

        let (ok_job, fail_job) = (job.to_string(), job.to_string());
        let config = NotifierConfig::new(notify)
            .with_grid_config(&self.config)
            .notify_when(move || !pending_flag.load(Ordering::SeqCst))
            .on_success(move || tracing::debug!(job = %ok_job, "Terminal state acknowledged by all members"))
            .on_fail(move || tracing::warn!(job = %fail_job, "Gave up announcing terminal state"));
        ReliableNotifier::start(&self.scheduler, config)
    }

    /// Sends one heartbeat to the coordinator. True when acknowledged.
    pub(crate) async fn report_to_coordinator(&self, msg: JobStateMessage) -> bool {
        let Some(coordinator) = self.channel.coordinator() else {
            return false;
        };
        if coordinator == self.node_id() {
            return self
                .observations
                .record(&msg.job_name, coordinator, msg.observed_state)
                .is_ack();
        }
        match self
            .dispatcher
            .call_one(coordinator, GridCommand::ReportState(msg))
            .await
        {
            Ok(reply) => reply == GridReply::Ack,
            Err(e) => {
                tracing::trace!(error = %e, "Heartbeat not delivered");
                false
            }
        }
    }

    /// Spawns the loop that routes broadcasts (stop requests, run starts).
    pub(crate) fn start_message_pump(self: &Arc<Self>) {
        let mut rx = self.channel.subscribe();
        let ctx = Arc::clone(self);
        let token = self.scheduler.child_token();
        self.scheduler.spawn(async move {
            loop {
                let delivered = tokio::select! {
                    _ = token.cancelled() => break,
                    d = rx.recv() => d,
                };
                match delivered {
                    Ok(d) => ctx.on_message(d),
                    Err(RecvError::Lagged(n)) => {
                        tracing::warn!(node = %ctx.node_id(), skipped = n, "Message pump lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            tracing::debug!(node = %ctx.node_id(), "Message pump stopped");
        });
    }

    fn on_message(&self, delivered: Delivered) {
        match delivered.message {
            GridMessage::Stop(stop) => {
                let stopped = self.stops.stop(&stop.job_name);
                tracing::info!(name = %stop.job_name, from = %delivered.from, stopped, "Stop requested");
            }
            GridMessage::JobState(msg) => {
                if self.channel.coordinator() != Some(delivered.from) {
                    return;
                }
                let at = msg.observed_state;
                if at.state.is_terminal() {
                    self.board.publish(&msg.job_name, at);
                } else {
                    self.board.discard_older(&msg.job_name, at.timestamp_millis);
                }
            }
            GridMessage::Pipeline(msg) => {
                let from_coordinator = self.channel.coordinator() == Some(delivered.from);
                if msg.signal == PipelineSignal::Stop || from_coordinator {
                    self.pipelines.on_signal(msg);
                }
            }
        }
    }

    /// Drops every local cache tied to the current session.
    pub(crate) fn clear_local(&self) {
        self.observations.clear();
        self.board.clear();
        self.stops.clear_pending();
        self.pipelines.clear();
    }
}

#[async_trait]
impl CommandHandler for NodeContext {
    async fn handle(&self, from: NodeId, command: GridCommand) -> GridReply {
        match command {
            GridCommand::ReportState(msg) => {
                if self.is_coordinator() {
                    let recorded = self.observations.record(&msg.job_name, from, msg.observed_state);
                    if recorded.is_ack() {
                        GridReply::Ack
                    } else {
                        GridReply::Ignored
                    }
                } else if self.channel.coordinator() == Some(from) {
                    if msg.observed_state.state.is_terminal() {
                        self.board.publish(&msg.job_name, msg.observed_state);
                    }
                    GridReply::Ack
                } else {
                    tracing::debug!(job = %msg.job_name, from = %from, "Ignoring report from a non-coordinator");
                    GridReply::Ignored
                }
            }
        }
    }
}

/// Releases a [`NodeContext::try_claim`] on drop.
pub(crate) struct ClaimGuard {
    claims: Arc<Mutex<HashSet<String>>>,
    job: String,
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        lock(&self.claims).remove(&self.job);
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn record_acks(acked: &Mutex<HashSet<NodeId>>, replies: &HashMap<NodeId, GridReply>) {
    let mut acked = lock(acked);
    acked.extend(
        replies
            .iter()
            .filter(|(_, r)| **r == GridReply::Ack)
            .map(|(n, _)| *n),
    );
}
