//! Heartbeat / Barrier - 全ノード実行の「全員終わった？」判定
//!
//! # 学習ポイント
//! - 集約ロジックは純粋関数（[`compute_aggregate`]）に切り出してテストする
//! - 待機は `tokio::sync::Notify` + 定期再チェック + キャンセル
//! - ノードごとに「最新の観測」だけを持つので、到着順に依存しない
//!
//! # 集約ルール
//! 1. 報告済みノードが現在のメンバーの上位集合でなければ RUNNING
//! 2. 非終端かつ新鮮（staleness 窓の内側）なノードが 1 つでもあれば RUNNING
//! 3. 窓の外に出た非終端ノードはバリアから除外（warn ログ）
//! 4. それ以外は終端状態のうち ordinal が最大のもの。
//!    全員が除外されて誰も終わっていなければ FAILED

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::domain::{JobState, JobStateAtTime, NodeId};
use crate::ports::GroupChannel;

/// Latest known observation of one node for one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    pub observed: JobStateAtTime,
    /// Local receive time of the last heartbeat from that node.
    pub last_heard: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Aggregate {
    pub state: JobState,
    /// Non-terminal nodes left out because they went silent.
    pub excluded: Vec<NodeId>,
}

impl Aggregate {
    fn running() -> Self {
        Self {
            state: JobState::Running,
            excluded: Vec::new(),
        }
    }
}

/// Aggregate state of a barrier given the latest observation per node.
pub fn compute_aggregate(
    observations: &HashMap<NodeId, Observation>,
    members: &[NodeId],
    now: Instant,
    stale_after: Duration,
) -> Aggregate {
    if !members.iter().all(|m| observations.contains_key(m)) {
        return Aggregate::running();
    }

    let mut highest: Option<JobState> = None;
    let mut excluded = Vec::new();
    for (node, obs) in observations {
        let state = obs.observed.state;
        if state.is_terminal() {
            highest = highest.max(Some(state));
        } else if now.saturating_duration_since(obs.last_heard) <= stale_after {
            return Aggregate::running();
        } else {
            excluded.push(*node);
        }
    }
    excluded.sort();

    Aggregate {
        state: highest.unwrap_or(JobState::Failed),
        excluded,
    }
}

/// Outcome of [`ObservationLog::record`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recorded {
    Accepted,
    /// A newer observation of that node is already known.
    Outdated,
    /// No barrier is open for the job; the report was dropped.
    NoBarrier,
}

impl Recorded {
    /// Whether the reporting node may consider the report delivered.
    pub fn is_ack(self) -> bool {
        !matches!(self, Recorded::NoBarrier)
    }
}

/// Per-job, per-node observations collected by the coordinator.
///
/// Only jobs with an open barrier hold observations. Reports for any other
/// job are refused, so nothing from a closed run leaks into the next one.
#[derive(Default)]
pub struct ObservationLog {
    jobs: Mutex<HashMap<String, HashMap<NodeId, Observation>>>,
    changed: Notify,
}

impl ObservationLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, HashMap<NodeId, Observation>>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Keeps the newest observation per node and wakes barrier waiters.
    pub fn record(&self, job: &str, node: NodeId, observed: JobStateAtTime) -> Recorded {
        let recorded = {
            let mut jobs = self.lock();
            match jobs.get_mut(job) {
                None => Recorded::NoBarrier,
                Some(per_node) => match per_node.get(&node) {
                    Some(prev) if prev.observed.timestamp_millis > observed.timestamp_millis => Recorded::Outdated,
                    _ => {
                        per_node.insert(
                            node,
                            Observation {
                                observed,
                                last_heard: Instant::now(),
                            },
                        );
                        Recorded::Accepted
                    }
                },
            }
        };
        match recorded {
            Recorded::Accepted => {
                tracing::trace!(job, node = %node, state = %observed.state, "Heartbeat recorded");
                self.changed.notify_waiters();
            }
            Recorded::NoBarrier => {
                tracing::debug!(job, node = %node, state = %observed.state, "No open barrier, report dropped");
            }
            Recorded::Outdated => {}
        }
        recorded
    }

    /// Opens a fresh barrier: every member starts as IDLE heard now.
    ///
    /// Observations left from an earlier run of `job` are discarded.
    pub fn open(&self, job: &str, members: &[NodeId], at_millis: i64) {
        let now = Instant::now();
        let seeded = members
            .iter()
            .map(|m| {
                let idle = Observation {
                    observed: JobStateAtTime::new(JobState::Idle, at_millis),
                    last_heard: now,
                };
                (*m, idle)
            })
            .collect();
        self.lock().insert(job.to_string(), seeded);
    }

    pub fn is_open(&self, job: &str) -> bool {
        self.lock().contains_key(job)
    }

    pub fn snapshot(&self, job: &str) -> HashMap<NodeId, Observation> {
        self.lock().get(job).cloned().unwrap_or_default()
    }

    pub fn close(&self, job: &str) {
        self.lock().remove(job);
    }

    pub fn clear(&self) {
        self.lock().clear();
        self.changed.notify_waiters();
    }

    /// Waits until the aggregate for `job` is terminal.
    ///
    /// Re-evaluates on every recorded heartbeat and every `recheck`.
    /// Cancellation yields FAILED. The job's observations are dropped on
    /// return.
    pub async fn await_barrier(
        &self,
        job: &str,
        channel: &dyn GroupChannel,
        stale_after: Duration,
        recheck: Duration,
        cancel: &CancellationToken,
    ) -> JobState {
        let state = loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let aggregate =
                compute_aggregate(&self.snapshot(job), &channel.members(), Instant::now(), stale_after);
            if aggregate.state.is_terminal() {
                for node in &aggregate.excluded {
                    tracing::warn!(
                        job,
                        node = %node,
                        stale_after_ms = stale_after.as_millis() as u64,
                        "Node went silent, excluding it from the barrier"
                    );
                }
                break aggregate.state;
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::warn!(job, "Barrier wait interrupted");
                    break JobState::Failed;
                }
                _ = &mut notified => {}
                _ = tokio::time::sleep(recheck) => {}
            }
        };
        self.close(job);
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::LocalCluster;
    use rstest::rstest;
    use std::sync::Arc;

    const STALE: Duration = Duration::from_secs(30);

    fn obs(state: JobState, heard: Instant) -> Observation {
        Observation {
            observed: JobStateAtTime::new(state, 1),
            last_heard: heard,
        }
    }

    fn nodes(n: usize) -> Vec<NodeId> {
        let mut v: Vec<NodeId> = (0..n).map(|_| NodeId::generate()).collect();
        v.sort();
        v
    }

    #[test]
    fn missing_member_keeps_barrier_running() {
        let now = Instant::now();
        let m = nodes(3);
        let seen: HashMap<_, _> = m[..2]
            .iter()
            .map(|n| (*n, obs(JobState::Completed, now)))
            .collect();
        assert_eq!(compute_aggregate(&seen, &m, now, STALE).state, JobState::Running);
    }

    #[rstest]
    #[case::all_completed(&[JobState::Completed, JobState::Completed], JobState::Completed)]
    #[case::one_failed(&[JobState::Completed, JobState::Failed], JobState::Failed)]
    #[case::fresh_runner(&[JobState::Completed, JobState::Running], JobState::Running)]
    #[case::fresh_idle(&[JobState::Idle, JobState::Completed], JobState::Running)]
    fn aggregate_of_fresh_nodes(#[case] states: &[JobState], #[case] expected: JobState) {
        let now = Instant::now();
        let m = nodes(states.len());
        let seen: HashMap<_, _> = m.iter().zip(states).map(|(n, s)| (*n, obs(*s, now))).collect();
        assert_eq!(compute_aggregate(&seen, &m, now, STALE).state, expected);
    }

    #[test]
    fn stale_runner_is_excluded() {
        let start = Instant::now();
        let now = start + Duration::from_secs(31);
        let m = nodes(3);
        let mut seen = HashMap::new();
        seen.insert(m[0], obs(JobState::Completed, now));
        seen.insert(m[1], obs(JobState::Completed, now));
        seen.insert(m[2], obs(JobState::Running, start));

        let agg = compute_aggregate(&seen, &m, now, STALE);
        assert_eq!(agg.state, JobState::Completed);
        assert_eq!(agg.excluded, vec![m[2]]);
    }

    #[test]
    fn everyone_excluded_is_failed() {
        let start = Instant::now();
        let now = start + Duration::from_secs(60);
        let m = nodes(2);
        let seen: HashMap<_, _> = m.iter().map(|n| (*n, obs(JobState::Running, start))).collect();
        let agg = compute_aggregate(&seen, &m, now, STALE);
        assert_eq!(agg.state, JobState::Failed);
        assert_eq!(agg.excluded.len(), 2);
    }

    #[test]
    fn older_observation_does_not_replace_newer() {
        let log = ObservationLog::new();
        let n = NodeId::generate();
        log.open("j", &[n], 0);
        assert_eq!(log.record("j", n, JobStateAtTime::new(JobState::Completed, 10)), Recorded::Accepted);
        assert_eq!(log.record("j", n, JobStateAtTime::new(JobState::Running, 5)), Recorded::Outdated);
        assert_eq!(log.snapshot("j")[&n].observed.state, JobState::Completed);
    }

    #[test]
    fn reports_without_open_barrier_are_refused() {
        let log = ObservationLog::new();
        let n = NodeId::generate();
        let report = log.record("j", n, JobStateAtTime::new(JobState::Running, 10));
        assert_eq!(report, Recorded::NoBarrier);
        assert!(!report.is_ack());
        assert!(!log.is_open("j"));
        assert!(log.snapshot("j").is_empty());
    }

    #[test]
    fn late_report_does_not_leak_into_next_run() {
        let log = ObservationLog::new();
        let m = nodes(2);
        log.open("j", &m, 0);
        log.record("j", m[0], JobStateAtTime::new(JobState::Failed, 10));
        log.close("j");

        // a re-sent terminal state of the closed run
        assert_eq!(
            log.record("j", m[0], JobStateAtTime::new(JobState::Failed, 11)),
            Recorded::NoBarrier
        );

        log.open("j", &m, 20);
        let snap = log.snapshot("j");
        assert_eq!(snap[&m[0]].observed, JobStateAtTime::new(JobState::Idle, 20));
        assert_eq!(snap[&m[1]].observed, JobStateAtTime::new(JobState::Idle, 20));
    }

    #[tokio::test]
    async fn barrier_wakes_on_last_report() {
        let cluster = LocalCluster::new();
        let a = cluster.join();
        let b = cluster.join();
        let members = cluster.members();
        let log = Arc::new(ObservationLog::new());
        log.open("j", &members, 0);
        log.record("j", a.local_address(), JobStateAtTime::new(JobState::Completed, 1));

        let waiter = {
            let log = log.clone();
            let a = a.clone();
            tokio::spawn(async move {
                log.await_barrier("j", a.as_ref(), STALE, Duration::from_secs(10), &CancellationToken::new())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        log.record("j", b.local_address(), JobStateAtTime::new(JobState::Completed, 2));
        let state = tokio::time::timeout(Duration::from_secs(2), waiter).await.unwrap().unwrap();
        assert_eq!(state, JobState::Completed);
        assert!(log.snapshot("j").is_empty());
    }

    #[tokio::test]
    async fn cancelled_barrier_is_failed() {
        let cluster = LocalCluster::new();
        let a = cluster.join();
        let _b = cluster.join();
        let log = ObservationLog::new();
        log.open("j", &cluster.members(), 0);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let state = log
            .await_barrier("j", a.as_ref(), STALE, Duration::from_secs(10), &cancel)
            .await;
        assert_eq!(state, JobState::Failed);
    }
}
