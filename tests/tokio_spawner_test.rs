//! Running the scheduler on a tokio runtime's blocking pool.

#![cfg(feature = "tokio-runtime")]

use std::time::Duration;

use prometheus_slot_scheduler::runtime::TokioSpawner;
use prometheus_slot_scheduler::{Scheduler, SchedulerConfig, WatchdogConfig};

fn config() -> SchedulerConfig {
    SchedulerConfig::new()
        .with_max_concurrency(2)
        .with_preemptive(true)
        .with_watchdog(WatchdogConfig {
            enabled: false,
            ..WatchdogConfig::default()
        })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_tasks_run_on_blocking_pool() {
    let scheduler = Scheduler::builder(config())
        .spawner(TokioSpawner::current().unwrap())
        .build()
        .unwrap();

    let mut receivers = Vec::new();
    for p in [3, 9, 15] {
        let (tx, rx) = tokio::sync::oneshot::channel();
        scheduler
            .schedule_task(
                move |task| {
                    let _ = tx.send(task.priority());
                },
                p,
                None,
            )
            .unwrap();
        receivers.push(rx);
    }

    for rx in receivers {
        tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .unwrap()
            .unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_time_limit_on_blocking_pool() {
    let scheduler = Scheduler::builder(config())
        .spawner(TokioSpawner::current().unwrap())
        .build()
        .unwrap();

    let (tx, rx) = tokio::sync::oneshot::channel();
    scheduler
        .schedule_task(
            move |task| {
                while !task.is_canceled() {
                    std::thread::sleep(Duration::from_millis(2));
                }
                let _ = tx.send(());
            },
            1,
            Some(Duration::from_millis(30)),
        )
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .unwrap()
        .unwrap();
}

#[test]
fn test_current_requires_runtime() {
    assert!(TokioSpawner::current().is_err());
}

#[test]
fn test_watchdog_runs_on_explicit_handle() {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .enable_all()
        .build()
        .unwrap();
    let scheduler = Scheduler::builder(SchedulerConfig::new().with_max_concurrency(1))
        .spawner(TokioSpawner::new(runtime.handle().clone()))
        .build()
        .unwrap();
    assert!(scheduler.watchdog_state().is_some());
    scheduler.shutdown();
    assert_eq!(
        scheduler.watchdog_state(),
        Some(prometheus_slot_scheduler::WatchdogState::Stopped)
    );
}
