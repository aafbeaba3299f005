//! Single-Node policy: the coordinator runs the body, everybody else waits
//! for the terminal state it announces.

use std::sync::Arc;

use crate::app::context::NodeContext;
use crate::domain::JobState;

use super::{Work, run_body};

pub(super) async fn coordinate(ctx: &Arc<NodeContext>, job: &str, work: Work) -> JobState {
    let started = ctx.job_states.set(job, JobState::Running).await;
    ctx.announce_started(job, started).await;
    tracing::info!(job, node = %ctx.node_id(), "Coordinator executing job");

    let state = run_body(ctx, job, work).await;

    let at = ctx.job_states.set(job, state).await;
    ctx.announce_terminal(job, at);
    state
}

/// Suspends until the coordinator's terminal state for `job` arrives.
///
/// Node shutdown ends the wait with FAILED; the node token stays cancelled.
pub(crate) async fn await_terminal(ctx: &NodeContext, job: &str, not_before: Option<i64>) -> JobState {
    tracing::info!(job, node = %ctx.node_id(), "Waiting for coordinator to finish job");
    let rx = ctx.board.subscribe(job, not_before);
    tokio::select! {
        received = rx => match received {
            Ok(at) => at.state,
            Err(_) => JobState::Failed,
        },
        _ = ctx.scheduler.token().cancelled() => {
            tracing::warn!(job, node = %ctx.node_id(), "Wait for job result interrupted");
            JobState::Failed
        }
    }
}
