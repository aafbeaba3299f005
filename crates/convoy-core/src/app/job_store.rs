//! JobStateStore - ジョブ名ごとの正規状態（`{state, timestamp}`）の永続化
//!
//! # 設計原則
//! - 書き込むのはそのジョブを coordinator として実行しているノードだけ
//! - 操作の直前に毎回ストアの存在を確認する（「存在する」をキャッシュしない）
//! - ストアが無いのはシャットダウン競合で普通に起きること。エラーにはしない

use std::collections::HashMap;
use std::sync::Arc;

use crate::domain::{JobState, JobStateAtTime};
use crate::ports::{Clock, GridStore, MonotonicStamp, TypedMap};

pub const JOB_STATE_MAP: &str = "job_state";

#[derive(Clone)]
pub struct JobStateStore {
    map: TypedMap<JobStateAtTime>,
    clock: Arc<dyn Clock>,
    stamp: Arc<MonotonicStamp>,
}

impl JobStateStore {
    pub fn new(store: &dyn GridStore, clock: Arc<dyn Clock>, stamp: Arc<MonotonicStamp>) -> Self {
        Self {
            map: TypedMap::new(store.map(JOB_STATE_MAP)),
            clock,
            stamp,
        }
    }

    pub async fn get(&self, job_name: &str) -> Option<JobState> {
        self.get_at_time(job_name).await.map(|s| s.state)
    }

    pub async fn get_at_time(&self, job_name: &str) -> Option<JobStateAtTime> {
        if !self.map.exists().await {
            return None;
        }
        match self.map.get(job_name).await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(job = job_name, error = %e, "Unreadable job state record");
                None
            }
        }
    }

    /// Writes `{state, now}`, replacing any previous record.
    pub async fn set(&self, job_name: &str, state: JobState) -> JobStateAtTime {
        let at = JobStateAtTime::new(state, self.stamp.next(self.clock.as_ref()));
        self.set_at_time(job_name, at).await;
        at
    }

    pub async fn set_at_time(&self, job_name: &str, at: JobStateAtTime) {
        if !self.map.exists().await {
            tracing::debug!(job = job_name, state = %at.state, "Job state store is gone, not persisting");
            return;
        }
        if let Err(e) = self.map.put(job_name, &at).await {
            tracing::warn!(job = job_name, error = %e, "Could not persist job state");
        }
    }

    pub async fn running_jobs(&self) -> HashMap<String, JobStateAtTime> {
        if !self.map.exists().await {
            return HashMap::new();
        }
        self.map
            .entries()
            .await
            .into_iter()
            .filter(|(_, s)| s.state.is_running())
            .collect()
    }

    /// Clears every record. Returns whether anything was present.
    pub async fn reset(&self) -> bool {
        if !self.map.exists().await {
            return false;
        }
        self.map.clear().await
    }
}
