#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use brrtengine::response::HandlerResponse;
use brrtengine::runtime_config::{BackpressureMode, PoolConfig};
use brrtengine::worker_pool::{TaskHandle, WorkerPool};
use common::test_server::setup_may_runtime;
use http::StatusCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

type Outcome = Result<u16, String>;

/// Forward a handle's result to a channel the test thread can wait on.
fn collect(handle: TaskHandle) -> mpsc::Receiver<Outcome> {
    let (tx, rx) = mpsc::channel();
    handle.on_complete(move |result| {
        let _ = tx.send(
            result
                .map(|r| r.status.as_u16())
                .map_err(|e| e.to_string()),
        );
    });
    rx
}

fn wait(rx: &mpsc::Receiver<Outcome>) -> Outcome {
    rx.recv_timeout(Duration::from_secs(5))
        .expect("task completion within 5s")
}

/// Task that holds its worker until `gate` opens.
fn gated(gate: &Arc<AtomicBool>) -> impl FnOnce() -> anyhow::Result<HandlerResponse> + Send + 'static {
    let gate = Arc::clone(gate);
    move || {
        while !gate.load(Ordering::SeqCst) {
            may::coroutine::sleep(Duration::from_millis(1));
        }
        Ok(HandlerResponse::ok())
    }
}

#[test]
fn test_pool_runs_tasks_and_reports_results() {
    setup_may_runtime();
    let pool = WorkerPool::new("results", PoolConfig::default());

    let ok = collect(pool.submit(|| Ok(HandlerResponse::status(StatusCode::ACCEPTED))));
    let failed = collect(pool.submit(|| Err(anyhow::anyhow!("nope"))));

    assert_eq!(wait(&ok), Ok(202));
    assert_eq!(wait(&failed), Err("nope".to_string()));
    assert_eq!(pool.metrics().get_dispatched_count(), 2);
}

#[test]
fn test_pool_config_is_kept() {
    setup_may_runtime();
    let config = PoolConfig::new(3, 16, BackpressureMode::Shed, 10, 0x8000);
    let pool = WorkerPool::new("configured", config);
    assert_eq!(pool.config().num_workers, 3);
    assert_eq!(pool.config().queue_bound, 16);
    assert_eq!(pool.config().backpressure_mode, BackpressureMode::Shed);
    assert_eq!(pool.name(), "configured");
}

#[test]
fn test_shed_mode_rejects_when_full() {
    setup_may_runtime();
    let config = PoolConfig::new(1, 1, BackpressureMode::Shed, 0, 0x8000);
    let pool = WorkerPool::new("shed", config);
    let gate = Arc::new(AtomicBool::new(false));

    let held = collect(pool.submit(gated(&gate)));
    let shed = collect(pool.submit(|| Ok(HandlerResponse::ok())));

    let rejected = wait(&shed).unwrap_err();
    assert!(rejected.contains("queue full"), "{rejected}");
    assert_eq!(pool.metrics().get_shed_count(), 1);

    gate.store(true, Ordering::SeqCst);
    assert_eq!(wait(&held), Ok(200));
}

#[test]
fn test_block_mode_times_out() {
    setup_may_runtime();
    let config = PoolConfig::new(1, 1, BackpressureMode::Block, 20, 0x8000);
    let pool = WorkerPool::new("block", config);
    let gate = Arc::new(AtomicBool::new(false));

    let held = collect(pool.submit(gated(&gate)));
    let blocked = collect(pool.submit(|| Ok(HandlerResponse::ok())));

    let rejected = wait(&blocked).unwrap_err();
    assert!(rejected.contains("backpressure timeout"), "{rejected}");

    gate.store(true, Ordering::SeqCst);
    assert_eq!(wait(&held), Ok(200));
}

#[test]
fn test_shutdown_rejects_new_tasks() {
    setup_may_runtime();
    let pool = WorkerPool::new("closing", PoolConfig::default());
    pool.shutdown();
    assert!(pool.is_shut_down());

    let rejected = wait(&collect(pool.submit(|| Ok(HandlerResponse::ok())))).unwrap_err();
    assert!(rejected.contains("shut down"), "{rejected}");
}

#[test]
fn test_panicking_task_completes_with_error() {
    setup_may_runtime();
    let pool = WorkerPool::new("panics", PoolConfig::default());

    let rx = collect(pool.submit(|| panic!("task bug")));
    let err = wait(&rx).unwrap_err();
    assert!(err.contains("task bug"), "{err}");

    // the worker survives
    let rx = collect(pool.submit(|| Ok(HandlerResponse::ok())));
    assert_eq!(wait(&rx), Ok(200));
}

#[test]
fn test_callback_registered_late_still_fires() {
    setup_may_runtime();
    let pool = WorkerPool::new("late", PoolConfig::default());
    let handle = pool.submit(|| Ok(HandlerResponse::ok()));
    for _ in 0..500 {
        if handle.is_complete() {
            break;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    assert!(handle.is_complete());
    assert_eq!(wait(&collect(handle)), Ok(200));
}
