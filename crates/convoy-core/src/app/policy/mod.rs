//! Run policies - 「どのノードが実行し、誰が何を待つか」
//!
//! # 共通の流れ（`execute(job_name, once, work)`）
//! 1. 永続化された状態を読む（無ければ IDLE）
//! 2. `once` かつ実行済みなら、work を呼ばずにその状態を返す
//! 3. 自分が coordinator で、まだ RUNNING でなければ coordinator 側の処理。
//!    それ以外はワーカー側の処理
//! 4. FAILED は error ログに出すが、呼び出し側へはエラーにせず状態として返す
//!
//! ジョブ本体の失敗（Err / panic）は FAILED になる。`GridError` が返るのは
//! 協調レイヤーの障害（ノード停止済みなど）だけ。

mod all_nodes;
mod single_node;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::app::context::NodeContext;
use crate::domain::{GridError, GridResult, JobState, JobStateAtTime, WorkError};

pub use self::all_nodes::node_job_name;

pub type WorkFuture = Pin<Box<dyn Future<Output = Result<(), WorkError>> + Send>>;

/// A job body. It receives a token cancelled by a stop request or node
/// shutdown and is expected to return soon after.
pub struct Work(Box<dyn FnOnce(CancellationToken) -> WorkFuture + Send>);

impl Work {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), WorkError>> + Send + 'static,
    {
        Self(Box::new(move |token| Box::pin(f(token))))
    }

    fn start(self, token: CancellationToken) -> WorkFuture {
        (self.0)(token)
    }
}

/// Execution scope of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPolicy {
    /// The coordinator executes; every other caller waits for its result.
    SingleNode,
    /// Every node executes its own copy; calls return once all are done.
    AllNodes,
}

impl RunPolicy {
    pub(crate) async fn execute(
        self,
        ctx: &Arc<NodeContext>,
        job_name: &str,
        once: bool,
        work: Work,
    ) -> GridResult<JobState> {
        if ctx.scheduler.is_shut_down() {
            return Err(GridError::Shutdown);
        }

        let persisted = ctx.job_states.get_at_time(job_name).await;
        let state = persisted.map_or(JobState::Idle, |p| p.state);
        if once && state.has_ran() {
            tracing::info!(job = job_name, %state, "Job already ran in this session, skipping");
            return Ok(state);
        }

        let claim = (ctx.is_coordinator() && !state.is_running())
            .then(|| ctx.try_claim(job_name))
            .flatten();

        let outcome = match (self, claim) {
            (RunPolicy::SingleNode, Some(_claim)) => {
                single_node::coordinate(ctx, job_name, work).await
            }
            (RunPolicy::SingleNode, None) => {
                single_node::await_terminal(ctx, job_name, result_floor(persisted)).await
            }
            (RunPolicy::AllNodes, Some(_claim)) => all_nodes::coordinate(ctx, job_name, work).await,
            (RunPolicy::AllNodes, None) => {
                all_nodes::participate(ctx, job_name, persisted, work).await
            }
        };

        if outcome == JobState::Failed {
            tracing::error!(job = job_name, policy = ?self, "Job failed");
        } else {
            tracing::info!(job = job_name, state = %outcome, "Job finished");
        }
        Ok(outcome)
    }
}

/// Oldest terminal announcement a waiting worker may accept.
///
/// A RUNNING record belongs to the run being waited for, so its own end
/// qualifies. A terminal record is the end of an earlier run; only a newer
/// announcement qualifies.
pub(crate) fn result_floor(persisted: Option<JobStateAtTime>) -> Option<i64> {
    persisted.map(|p| {
        if p.state.is_running() {
            p.timestamp_millis
        } else {
            p.timestamp_millis.saturating_add(1)
        }
    })
}

/// Runs `work` under a stop registration and maps its end to a state.
pub(crate) async fn run_body(ctx: &NodeContext, name: &str, work: Work) -> JobState {
    let guard = ctx.stops.register(name, ctx.scheduler.token());
    let handle = ctx.scheduler.spawn(work.start(guard.token()));
    match handle.await {
        Ok(Ok(())) => JobState::Completed,
        Ok(Err(e)) => {
            tracing::error!(job = name, node = %ctx.node_id(), error = %e, "Job body failed");
            JobState::Failed
        }
        Err(e) if e.is_panic() => {
            tracing::error!(job = name, node = %ctx.node_id(), "Job body panicked");
            JobState::Failed
        }
        Err(e) => {
            tracing::error!(job = name, node = %ctx.node_id(), error = %e, "Job body aborted");
            JobState::Failed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::never_ran(None, None)]
    #[case::running(Some(JobStateAtTime::new(JobState::Running, 10)), Some(10))]
    #[case::completed(Some(JobStateAtTime::new(JobState::Completed, 10)), Some(11))]
    #[case::failed(Some(JobStateAtTime::new(JobState::Failed, 10)), Some(11))]
    fn waiting_worker_skips_earlier_runs(#[case] persisted: Option<JobStateAtTime>, #[case] floor: Option<i64>) {
        assert_eq!(result_floor(persisted), floor);
    }
}
