// Bulk and group operations over real `sh` children.

#![cfg(unix)]

use procwarden::{EventStore, ProcessConfig, ProcessStatus, Supervisor, SupervisorConfig};
use std::time::Duration;
use tokio::time::{sleep, Instant};

fn sleeper(name: &str, order: i32) -> ProcessConfig {
    ProcessConfig::new(name, "sh")
        .with_args(["-c", "exec sleep 30"])
        .with_order(order)
}

fn supervisor(processes: Vec<ProcessConfig>, start_delay_ms: u64) -> Supervisor {
    let mut config = SupervisorConfig::default();
    config.node_name = "bulk".into();
    config.start_delay_ms = start_delay_ms;
    config.processes = processes;
    config
        .groups
        .insert("web".into(), vec!["api".into(), "worker".into()]);
    Supervisor::new(config)
        .unwrap()
        .with_settle_delay(Duration::from_millis(50))
}

async fn wait_until<F: Fn() -> bool>(what: &str, timeout: Duration, cond: F) {
    let deadline = Instant::now() + timeout;
    while !cond() {
        if Instant::now() >= deadline {
            panic!("timed out waiting for {}", what);
        }
        sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn start_all_runs_buckets_in_order_with_delay() {
    let sup = supervisor(
        vec![sleeper("db", 1), sleeper("api", 2), sleeper("worker", 2)],
        300,
    );

    let started = sup.coordinator().start_all().await;
    assert_eq!(started, 3);

    let db = sup.get("db").unwrap();
    let api = sup.get("api").unwrap();
    let worker = sup.get("worker").unwrap();
    for snap in [&db, &api, &worker] {
        assert_eq!(snap.status, ProcessStatus::Running);
    }
    let gap = api.start_time.unwrap() - db.start_time.unwrap();
    assert!(gap.num_milliseconds() >= 300, "second bucket waited, gap {:?}", gap);
    let gap = worker.start_time.unwrap() - db.start_time.unwrap();
    assert!(gap.num_milliseconds() >= 300);

    // Live records are skipped by a second pass.
    assert_eq!(sup.coordinator().start_all().await, 0);

    assert_eq!(sup.coordinator().stop_all().await, 3);
    assert!(sup.all().iter().all(|s| s.status == ProcessStatus::Stopped && !s.alive));
}

#[tokio::test(flavor = "multi_thread")]
async fn one_failed_member_does_not_block_the_rest() {
    let sup = supervisor(
        vec![
            ProcessConfig::new("api", "/definitely/not/a/binary").with_order(1),
            sleeper("worker", 2),
        ],
        10,
    );

    assert_eq!(sup.coordinator().start_all().await, 2);
    assert_eq!(sup.get("api").unwrap().status, ProcessStatus::FailedToStart);
    assert_eq!(sup.get("worker").unwrap().status, ProcessStatus::Running);

    assert_eq!(sup.shutdown().await, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn group_operations_touch_only_members() {
    let sup = supervisor(
        vec![sleeper("api", 1), sleeper("worker", 1), sleeper("db", 1)],
        10,
    );

    assert_eq!(sup.coordinator().start_group("web").await.unwrap(), 2);
    assert_eq!(sup.get("db").unwrap().status, ProcessStatus::NotStarted);

    let api_pid = sup.get("api").unwrap().pid;
    assert_eq!(sup.coordinator().restart_group("web").await.unwrap(), 2);
    let api = sup.get("api").unwrap();
    assert_eq!(api.status, ProcessStatus::Running);
    assert_ne!(api.pid, api_pid);

    assert_eq!(sup.coordinator().stop_group("web").await.unwrap(), 2);
    assert_eq!(sup.get("worker").unwrap().status, ProcessStatus::Stopped);
    assert_eq!(sup.get("db").unwrap().status, ProcessStatus::NotStarted);
}

#[tokio::test(flavor = "multi_thread")]
async fn facade_calls_return_before_the_work_finishes() {
    let sup = supervisor(vec![sleeper("api", 1), sleeper("worker", 2)], 10);

    sup.start_group("web").unwrap();
    wait_until("web running", Duration::from_secs(5), || {
        sup.by_group("web")
            .unwrap()
            .iter()
            .all(|s| s.status == ProcessStatus::Running)
    })
    .await;

    sup.restart("api").unwrap();
    wait_until("api restarted", Duration::from_secs(10), || {
        sup.events().find_by_status(ProcessStatus::Starting).len() == 3
            && sup.get("api").unwrap().status == ProcessStatus::Running
    })
    .await;

    sup.stop_all();
    wait_until("everything stopped", Duration::from_secs(10), || {
        sup.all().iter().all(|s| !s.alive)
    })
    .await;
    assert_eq!(sup.get("worker").unwrap().status, ProcessStatus::Stopped);
}

#[tokio::test(flavor = "multi_thread")]
async fn boot_auto_starts_flagged_processes() {
    let mut auto = sleeper("api", 1);
    auto.auto_start = true;
    let mut config = SupervisorConfig::default();
    config.auto_start = true;
    config.start_delay_ms = 10;
    config.processes = vec![auto, sleeper("worker", 1)];
    let sup = Supervisor::new(config).unwrap();

    assert_eq!(sup.boot().await, 1);
    assert_eq!(sup.get("api").unwrap().status, ProcessStatus::Running);
    assert_eq!(sup.get("worker").unwrap().status, ProcessStatus::NotStarted);

    assert_eq!(sup.shutdown().await, 1);
    assert_eq!(sup.get("api").unwrap().status, ProcessStatus::Stopped);
}
