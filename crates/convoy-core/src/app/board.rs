//! TerminalBoard - coordinator が告知したジョブ終端状態の受け口
//!
//! ワーカー側の待機は `oneshot` で受け取る（ポーリングしない）。
//!
//! - 到着時に待機者がいれば全員に渡す
//! - いなければ「未受領」として 1 件だけ保持し、次の待機者が受け取る
//! - 同じ告知の再送はタイムスタンプで弾く
//! - 新しい実行が始まったら（RUNNING の告知）保持分を捨てる

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;

use crate::domain::JobStateAtTime;

#[derive(Default)]
struct BoardState {
    waiters: HashMap<String, Vec<oneshot::Sender<JobStateAtTime>>>,
    unclaimed: HashMap<String, JobStateAtTime>,
    last_seen: HashMap<String, i64>,
}

#[derive(Default)]
pub struct TerminalBoard {
    state: Mutex<BoardState>,
}

impl TerminalBoard {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BoardState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hands a terminal announcement to the current waiters.
    ///
    /// Returns false for a duplicate (not newer than the last one seen).
    pub fn publish(&self, job: &str, at: JobStateAtTime) -> bool {
        let mut state = self.lock();
        if state.last_seen.get(job).is_some_and(|seen| *seen >= at.timestamp_millis) {
            return false;
        }
        state.last_seen.insert(job.to_string(), at.timestamp_millis);

        let delivered = state
            .waiters
            .remove(job)
            .unwrap_or_default()
            .into_iter()
            .map(|tx| tx.send(at).is_ok())
            .filter(|ok| *ok)
            .count();
        if delivered == 0 {
            state.unclaimed.insert(job.to_string(), at);
        }
        tracing::debug!(job, state = %at.state, delivered, "Terminal state received");
        true
    }

    /// Registers a waiter for the next terminal announcement of `job`.
    ///
    /// A parked announcement is handed over at once when its timestamp is
    /// not older than `not_before`.
    pub fn subscribe(&self, job: &str, not_before: Option<i64>) -> oneshot::Receiver<JobStateAtTime> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.lock();
        if let Some(parked) = state.unclaimed.remove(job) {
            if not_before.is_none_or(|t| parked.timestamp_millis >= t) {
                // receiver is alive right here
                let _ = tx.send(parked);
                return rx;
            }
            tracing::debug!(job, "Dropping terminal state of an earlier run");
        }
        state.waiters.entry(job.to_string()).or_default().push(tx);
        rx
    }

    /// Forgets a parked announcement older than a run started at `started`.
    pub fn discard_older(&self, job: &str, started: i64) {
        let mut state = self.lock();
        if state
            .unclaimed
            .get(job)
            .is_some_and(|parked| parked.timestamp_millis < started)
        {
            state.unclaimed.remove(job);
        }
    }

    /// Drops parked values and dedupe marks. Pending waiters stay.
    pub fn clear(&self) {
        let mut state = self.lock();
        state.unclaimed.clear();
        state.last_seen.clear();
    }
}
