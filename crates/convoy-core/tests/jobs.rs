mod common;

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use common::{TestCluster, fast_config, within};
use convoy_core::app::node_job_name;
use convoy_core::domain::JobStateAtTime;
use convoy_core::{GridCompute, GridError, JobState, WorkError};
use tokio::sync::Notify;

fn counting(counter: &Arc<AtomicUsize>) -> Arc<AtomicUsize> {
    Arc::clone(counter)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_node_once_runs_exactly_once() {
    let cluster = TestCluster::start(3, fast_config());
    let runs = Arc::new(AtomicUsize::new(0));

    let states = on_every_node(&cluster, |_, compute| {
        let runs = counting(&runs);
        async move {
            compute
                .run_on_one_once("indexBuild", move |_stop| async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(())
                })
                .await
        }
    })
    .await;
    for state in states {
        assert_eq!(state.unwrap(), JobState::Completed);
    }
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    // every later call in the same session is a skip
    for node in &cluster.nodes {
        let runs = counting(&runs);
        let state = within(node.compute().run_on_one_once("indexBuild", move |_stop| async move {
            runs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }))
        .await
        .unwrap();
        assert_eq!(state, JobState::Completed);
    }
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    let persisted = cluster.coordinator().compute().job_state("indexBuild").await.unwrap();
    assert_eq!(persisted.state, JobState::Completed);

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failing_body_is_failed_everywhere_not_an_error() {
    let cluster = TestCluster::start(2, fast_config());
    let (a, b) = (&cluster.nodes[0], &cluster.nodes[1]);

    let (on_a, on_b) = within(async {
        tokio::join!(
            a.compute().run_on_one("compact", |_stop| async {
                tokio::time::sleep(Duration::from_millis(30)).await;
                Err(WorkError::msg("disk full"))
            }),
            b.compute().run_on_one("compact", |_stop| async { Ok(()) }),
        )
    })
    .await;
    assert_eq!(on_a.unwrap(), JobState::Failed);
    assert_eq!(on_b.unwrap(), JobState::Failed);
    assert_eq!(a.compute().job_state("compact").await.unwrap().state, JobState::Failed);

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn worker_waits_for_the_next_run_not_the_last_one() {
    let cluster = TestCluster::start(2, fast_config());
    let (a, b) = (&cluster.nodes[0], &cluster.nodes[1]);

    let first = within(a.compute().run_on_one("compact", |_stop| async {
        Err(WorkError::msg("disk full"))
    }))
    .await
    .unwrap();
    assert_eq!(first, JobState::Failed);
    // the announcement of run 1 is parked on b
    tokio::time::sleep(Duration::from_millis(50)).await;

    let waiting = {
        let compute = b.compute().clone();
        tokio::spawn(async move { compute.run_on_one("compact", |_stop| async { Ok(()) }).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!waiting.is_finished());

    let second = within(a.compute().run_on_one("compact", |_stop| async { Ok(()) }))
        .await
        .unwrap();
    assert_eq!(second, JobState::Completed);
    assert_eq!(within(waiting).await.unwrap().unwrap(), JobState::Completed);

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn panicking_body_is_failed() {
    let cluster = TestCluster::start(1, fast_config());
    let state = within(cluster.coordinator().compute().run_on_one("boom", |_stop| async {
        panic!("body blew up");
    }))
    .await
    .unwrap();
    assert_eq!(state, JobState::Failed);
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn all_nodes_run_their_own_copy() {
    let cluster = TestCluster::start(3, fast_config());
    let runs = Arc::new(AtomicUsize::new(0));

    let states = on_every_node(&cluster, |_, compute| {
        let runs = counting(&runs);
        async move {
            compute
                .run_on_all("warmCache", move |_stop| async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    Ok(())
                })
                .await
        }
    })
    .await;
    for state in states {
        assert_eq!(state.unwrap(), JobState::Completed);
    }
    assert_eq!(runs.load(Ordering::SeqCst), 3);

    let coordinator = cluster.coordinator().compute();
    assert_eq!(coordinator.job_state("warmCache").await.unwrap().state, JobState::Completed);
    // only the coordinator persists its node-scoped copy
    assert_eq!(
        coordinator.job_state(&node_job_name("warmCache")).await.unwrap().state,
        JobState::Completed
    );
    assert!(coordinator.running_jobs().await.is_empty());

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn job_state_never_moves_back_to_running() {
    let cluster = TestCluster::start(3, fast_config());
    let coordinator = cluster.coordinator().compute().clone();

    let sampler = {
        let compute = coordinator.clone();
        tokio::spawn(async move {
            let mut seen = Vec::new();
            loop {
                let outer = compute.job_state("warmCache").await;
                let own = compute.job_state(&node_job_name("warmCache")).await;
                seen.push((outer, own));
                if outer.is_some_and(|at| at.state.is_terminal()) {
                    return seen;
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
    };

    let states = on_every_node(&cluster, |_, compute| async move {
        compute
            .run_on_all("warmCache", |_stop| async {
                tokio::time::sleep(Duration::from_millis(40)).await;
                Ok(())
            })
            .await
    })
    .await;
    for state in states {
        assert_eq!(state.unwrap(), JobState::Completed);
    }
    let mut seen = within(sampler).await.unwrap();
    // a few more reads after the call returned
    for _ in 0..5 {
        seen.push((
            coordinator.job_state("warmCache").await,
            coordinator.job_state(&node_job_name("warmCache")).await,
        ));
    }

    assert_never_backwards(seen.iter().filter_map(|(outer, _)| *outer).collect());
    assert_never_backwards(seen.iter().filter_map(|(_, own)| *own).collect());
    cluster.shutdown().await;
}

fn assert_never_backwards(records: Vec<JobStateAtTime>) {
    for pair in records.windows(2) {
        assert!(pair[1].timestamp_millis >= pair[0].timestamp_millis);
        if pair[0].state.is_terminal() {
            assert_eq!(pair[1], pair[0], "state moved after {}", pair[0].state);
        }
    }
    assert_eq!(records.last().map(|r| r.state), Some(JobState::Completed));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn all_nodes_one_failure_fails_the_job() {
    let cluster = TestCluster::start(3, fast_config());

    let states = on_every_node(&cluster, |i, compute| async move {
        compute
            .run_on_all("migrate", move |_stop| async move {
                if i == 2 {
                    return Err(WorkError::msg("schema mismatch"));
                }
                Ok(())
            })
            .await
    })
    .await;
    for state in states {
        assert_eq!(state.unwrap(), JobState::Failed);
    }
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn silent_node_is_excluded_from_the_barrier() {
    let cluster = TestCluster::start(3, fast_config());
    let (a, b, c) = (&cluster.nodes[0], &cluster.nodes[1], &cluster.nodes[2]);
    let c_started = Arc::new(Notify::new());

    let c_call = {
        let compute = c.compute().clone();
        let started = Arc::clone(&c_started);
        tokio::spawn(async move {
            compute
                .run_on_all("warmCache", move |stop| async move {
                    started.notify_one();
                    stop.cancelled().await;
                    Err(WorkError::Stopped)
                })
                .await
        })
    };
    within(c_started.notified()).await;
    // let a few RUNNING heartbeats through before the partition
    tokio::time::sleep(Duration::from_millis(100)).await;
    cluster.net.mute(c.id());

    let (on_a, on_b) = within(async {
        tokio::join!(
            a.compute().run_on_all("warmCache", |_stop| async { Ok(()) }),
            b.compute().run_on_all("warmCache", |_stop| async { Ok(()) }),
        )
    })
    .await;
    assert_eq!(on_a.unwrap(), JobState::Completed);
    assert_eq!(on_b.unwrap(), JobState::Completed);

    // shutting the partitioned node down interrupts its wait
    c.shutdown().await;
    let on_c = within(c_call).await.unwrap().unwrap();
    assert_eq!(on_c, JobState::Failed);

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stop_reaches_the_running_body() {
    let cluster = TestCluster::start(2, fast_config());
    let (a, b) = (&cluster.nodes[0], &cluster.nodes[1]);
    let started = Arc::new(Notify::new());

    let running = {
        let compute = a.compute().clone();
        let started = Arc::clone(&started);
        tokio::spawn(async move {
            compute
                .run_on_one("reindex", move |stop| async move {
                    started.notify_one();
                    stop.cancelled().await;
                    Err(WorkError::Stopped)
                })
                .await
        })
    };
    within(started.notified()).await;

    // asked from a node that does not run it
    assert_eq!(b.compute().stop("reindex").await.unwrap(), 0);
    let state = within(running).await.unwrap().unwrap();
    assert_eq!(state, JobState::Failed);

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stop_before_start_is_remembered() {
    let cluster = TestCluster::start(1, fast_config());
    let compute = cluster.coordinator().compute();

    compute.stop("early").await.unwrap();
    let state = within(compute.run_on_one("early", |stop| async move {
        stop.cancelled().await;
        Err(WorkError::Stopped)
    }))
    .await
    .unwrap();
    assert_eq!(state, JobState::Failed);

    // consumed by that run
    let state = within(compute.run_on_one("early", |_stop| async { Ok(()) }))
        .await
        .unwrap();
    assert_eq!(state, JobState::Completed);
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reset_session_allows_once_jobs_again() {
    let cluster = TestCluster::start(1, fast_config());
    let compute = cluster.coordinator().compute();
    let runs = Arc::new(AtomicUsize::new(0));

    for _ in 0..2 {
        let runs = counting(&runs);
        within(compute.run_on_one_once("bootstrap", move |_stop| async move {
            runs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }))
        .await
        .unwrap();
    }
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    assert!(compute.reset_session().await);
    assert_eq!(compute.job_state("bootstrap").await, None);

    let again = counting(&runs);
    let state = within(compute.run_on_one_once("bootstrap", move |_stop| async move {
        again.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }))
    .await
    .unwrap();
    assert_eq!(state, JobState::Completed);
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_interrupts_waiting_callers() {
    let cluster = TestCluster::start(2, fast_config());
    let (a, b) = (&cluster.nodes[0], &cluster.nodes[1]);
    let started = Arc::new(Notify::new());

    let long = {
        let compute = a.compute().clone();
        let started = Arc::clone(&started);
        tokio::spawn(async move {
            compute
                .run_on_one("longJob", move |stop| async move {
                    started.notify_one();
                    stop.cancelled().await;
                    Ok(())
                })
                .await
        })
    };
    within(started.notified()).await;

    let waiting = {
        let compute = b.compute().clone();
        tokio::spawn(async move { compute.run_on_one("longJob", |_stop| async { Ok(()) }).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    b.shutdown().await;
    assert_eq!(within(waiting).await.unwrap().unwrap(), JobState::Failed);

    // the interrupt sticks: later calls on that node fail fast
    let after = b.compute().run_on_one("longJob", |_stop| async { Ok(()) }).await;
    assert!(matches!(after, Err(GridError::Shutdown)));

    a.shutdown().await;
    within(long).await.unwrap().unwrap();
}

/// Runs one call per node concurrently, each on its own task.
async fn on_every_node<F, Fut>(cluster: &TestCluster, call: F) -> Vec<Result<JobState, GridError>>
where
    F: Fn(usize, GridCompute) -> Fut,
    Fut: Future<Output = Result<JobState, GridError>> + Send + 'static,
{
    let handles: Vec<_> = cluster
        .nodes
        .iter()
        .enumerate()
        .map(|(i, node)| tokio::spawn(call(i, node.compute().clone())))
        .collect();
    let mut states = Vec::with_capacity(handles.len());
    for handle in handles {
        states.push(within(handle).await.unwrap());
    }
    states
}
