//! All-Node policy: every node runs its own copy of the body as the
//! node-scoped sub-job `<job>__NODE`.
//!
//! - coordinator: persists the outer job, runs its own copy, then waits on
//!   the barrier and persists/announces the aggregate
//! - worker: reports its sub-job as heartbeats (never persisted), then waits
//!   for the coordinator's aggregate like a Single-Node worker

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::app::context::NodeContext;
use crate::app::notifier::{NotifierConfig, ReliableNotifier};
use crate::domain::{JobState, JobStateAtTime, JobStateMessage};

use super::single_node::await_terminal;
use super::{Work, result_floor, run_body};

const NODE_JOB_SUFFIX: &str = "__NODE";

pub fn node_job_name(job: &str) -> String {
    format!("{job}{NODE_JOB_SUFFIX}")
}

pub(super) async fn coordinate(ctx: &Arc<NodeContext>, job: &str, work: Work) -> JobState {
    let node_job = node_job_name(job);
    let me = ctx.node_id();

    let started = ctx.job_states.set(job, JobState::Running).await;
    ctx.observations
        .open(&node_job, &ctx.channel.members(), started.timestamp_millis);
    ctx.announce_started(job, started).await;
    tracing::info!(job, node = %me, members = ctx.channel.members().len(), "Coordinator starting all-node job");

    let own_start = ctx.job_states.set(&node_job, JobState::Running).await;
    ctx.observations.record(&node_job, me, own_start);
    let own = run_body(ctx, job, work).await;
    let own_end = ctx.job_states.set(&node_job, own).await;
    ctx.observations.record(&node_job, me, own_end);

    let aggregate = ctx
        .observations
        .await_barrier(
            &node_job,
            ctx.channel.as_ref(),
            ctx.config.node_stale_timeout(),
            ctx.config.barrier_recheck_interval(),
            ctx.scheduler.token(),
        )
        .await;
    tracing::info!(job, state = %aggregate, "All nodes done");

    let at = ctx.job_states.set(job, aggregate).await;
    ctx.announce_terminal(job, at);
    aggregate
}

pub(super) async fn participate(
    ctx: &Arc<NodeContext>,
    job: &str,
    persisted: Option<JobStateAtTime>,
    work: Work,
) -> JobState {
    let heartbeat = NodeHeartbeat::start(ctx, node_job_name(job));
    let own = run_body(ctx, job, work).await;
    heartbeat.finish(own);
    tracing::debug!(job, node = %ctx.node_id(), state = %own, "Node copy finished");

    await_terminal(ctx, job, result_floor(persisted)).await
}

/// Worker-side heartbeat of a node-scoped sub-job.
///
/// Sends on every state change and at least every `max_notify_interval`,
/// each time with a fresh timestamp, until the coordinator acknowledged the
/// terminal state.
struct NodeHeartbeat {
    state: Arc<Mutex<JobState>>,
    changed: Arc<AtomicBool>,
    _notifier: ReliableNotifier,
}

impl NodeHeartbeat {
    fn start(ctx: &Arc<NodeContext>, node_job: String) -> Self {
        let state = Arc::new(Mutex::new(JobState::Running));
        let changed = Arc::new(AtomicBool::new(true));
        let sent_terminal = Arc::new(AtomicBool::new(false));

        let notify = {
            let ctx = Arc::clone(ctx);
            let state = Arc::clone(&state);
            let changed = Arc::clone(&changed);
            let sent_terminal = Arc::clone(&sent_terminal);
            let node_job = node_job.clone();
            move || {
                changed.store(false, Ordering::SeqCst);
                let current = *state.lock().unwrap_or_else(PoisonError::into_inner);
                if current.is_terminal() {
                    sent_terminal.store(true, Ordering::SeqCst);
                }
                let msg = JobStateMessage::new(node_job.clone(), ctx.stamped(current));
                let ctx = Arc::clone(&ctx);
                let changed = Arc::clone(&changed);
                async move {
                    let acked = ctx.report_to_coordinator(msg).await;
                    if !acked {
                        changed.store(true, Ordering::SeqCst);
                    }
                    acked
                }
            }
        };

        let should_notify = Arc::clone(&changed);
        let fail_job = node_job.clone();
        let config = NotifierConfig::new(notify)
            .with_grid_config(&ctx.config)
            .notify_when(move || should_notify.load(Ordering::SeqCst))
            .done_when(move || sent_terminal.load(Ordering::SeqCst))
            .on_success(move || tracing::debug!(job = %node_job, "Coordinator acknowledged node result"))
            .on_fail(move || tracing::warn!(job = %fail_job, "Coordinator never acknowledged node result"));

        Self {
            state,
            changed,
            _notifier: ReliableNotifier::start(&ctx.scheduler, config),
        }
    }

    fn finish(&self, terminal: JobState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = terminal;
        self.changed.store(true, Ordering::SeqCst);
    }
}
