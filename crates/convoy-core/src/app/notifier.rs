//! ReliableNotifier - 「終わった」を ack が返るまで送り続けるプロトコル
//!
//! # 学習ポイント
//! - 配送保証の無いメッセージングの上で、受信側の ack を条件に再送する
//! - 1 本の tick ループ（`tokio::time::interval`）をノードの Scheduler 上で回す
//! - コールバックは `FnOnce`（成功 / 失敗はちょうど 1 回だけ呼ばれる）
//!
//! # 1 tick の流れ
//! 1. `should_notify()` が true、または最後の送信から `max_notify_interval`
//!    経過していれば `notify()` を呼び、ack の有無と送信時刻を記録
//! 2. `is_done()` が true なら
//!    - 直前の送信が ack 済み → `on_success`、終了
//!    - そうでなければ試行回数 +1。上限に達したら `on_fail`、終了
//! 3. それ以外は次の tick へ

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::app::config::GridConfig;
use crate::app::scheduler::Scheduler;

pub type NotifyFuture = Pin<Box<dyn Future<Output = bool> + Send>>;

type Predicate = Box<dyn Fn() -> bool + Send + Sync>;
type NotifyFn = Box<dyn Fn() -> NotifyFuture + Send + Sync>;
type Callback = Box<dyn FnOnce() + Send>;

/// How a run of the notifier ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyOutcome {
    Acknowledged,
    GaveUp,
    Cancelled,
}

/// Parameters of one retry-until-ack run.
///
/// ```ignore
/// let cfg = NotifierConfig::new(move || send_report())
///     .done_when(move || finished.load(Ordering::SeqCst))
///     .on_success(|| tracing::info!("delivered"));
/// ```
pub struct NotifierConfig {
    is_done: Predicate,
    should_notify: Predicate,
    notify: NotifyFn,
    on_success: Option<Callback>,
    on_fail: Option<Callback>,
    max_attempts: Option<u32>,
    max_notify_interval: Duration,
    tick_interval: Duration,
}

impl NotifierConfig {
    pub fn new<F, Fut>(notify: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let defaults = GridConfig::default();
        Self {
            is_done: Box::new(|| true),
            should_notify: Box::new(|| false),
            notify: Box::new(move || Box::pin(notify())),
            on_success: None,
            on_fail: None,
            max_attempts: defaults.notify_max_attempts(),
            max_notify_interval: defaults.max_notify_interval(),
            tick_interval: defaults.tick_interval(),
        }
    }

    /// Takes attempt budget and intervals from the node configuration.
    pub fn with_grid_config(mut self, config: &GridConfig) -> Self {
        self.max_attempts = config.notify_max_attempts();
        self.max_notify_interval = config.max_notify_interval();
        self.tick_interval = config.tick_interval();
        self
    }

    pub fn done_when(mut self, f: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        self.is_done = Box::new(f);
        self
    }

    pub fn notify_when(mut self, f: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        self.should_notify = Box::new(f);
        self
    }

    pub fn on_success(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.on_success = Some(Box::new(f));
        self
    }

    pub fn on_fail(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.on_fail = Some(Box::new(f));
        self
    }

    /// `None` retries forever.
    pub fn max_attempts(mut self, max: Option<u32>) -> Self {
        self.max_attempts = max;
        self
    }

    pub fn max_notify_interval(mut self, interval: Duration) -> Self {
        self.max_notify_interval = interval;
        self
    }

    pub fn tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }
}

/// Handle on a running notifier.
pub struct ReliableNotifier {
    cancel: CancellationToken,
    join: JoinHandle<NotifyOutcome>,
}

impl ReliableNotifier {
    /// Starts the tick loop on `scheduler`. Node shutdown cancels it.
    pub fn start(scheduler: &Scheduler, config: NotifierConfig) -> Self {
        let cancel = scheduler.child_token();
        let join = scheduler.spawn(run(config, cancel.clone()));
        Self { cancel, join }
    }

    /// Stops ticking without calling either callback.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn finished(self) -> NotifyOutcome {
        match self.join.await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(error = %e, "Notifier loop aborted");
                NotifyOutcome::Cancelled
            }
        }
    }
}

async fn run(config: NotifierConfig, cancel: CancellationToken) -> NotifyOutcome {
    let NotifierConfig {
        is_done,
        should_notify,
        notify,
        mut on_success,
        mut on_fail,
        max_attempts,
        max_notify_interval,
        tick_interval,
    } = config;

    let mut ticker = tokio::time::interval(tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut last_sent: Option<Instant> = None;
    let mut acked = false;
    let mut attempts: u32 = 0;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return NotifyOutcome::Cancelled,
            _ = ticker.tick() => {}
        }

        let interval_elapsed = last_sent.is_none_or(|t| t.elapsed() >= max_notify_interval);
        if should_notify() || interval_elapsed {
            acked = tokio::select! {
                _ = cancel.cancelled() => return NotifyOutcome::Cancelled,
                acked = notify() => acked,
            };
            last_sent = Some(Instant::now());
        }

        if !is_done() {
            continue;
        }
        if acked {
            if let Some(f) = on_success.take() {
                f();
            }
            return NotifyOutcome::Acknowledged;
        }
        attempts = attempts.saturating_add(1);
        tracing::trace!(attempts, "Terminal notification not acknowledged yet");
        if max_attempts.is_some_and(|max| attempts >= max) {
            tracing::warn!(attempts, "Giving up on unacknowledged notification");
            if let Some(f) = on_fail.take() {
                f();
            }
            return NotifyOutcome::GaveUp;
        }
    }
}
