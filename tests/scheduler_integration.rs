//! Integration tests for admission control: the concurrency ceiling, slot
//! accounting, FIFO order, cancellation and shutdown.

mod common;

use std::sync::Arc;
use std::time::Duration;

use aule::events::LifecycleEvent;
use aule::worker::{Job, JobStatus, TaskKind, WorkerSpec};

use common::{Behavior, Harness, TEST_TIMEOUT, eventually, wait_for};

fn agent_spec(prompt: &str) -> WorkerSpec {
    WorkerSpec::new("aule-worker:test").with_prompt(prompt)
}

fn slow_workers(delay_ms: u64) -> Behavior {
    Behavior {
        execute_delay: Some(Duration::from_millis(delay_ms)),
        ..Default::default()
    }
}

#[tokio::test]
async fn running_jobs_never_exceed_ceiling() {
    let h = Harness::new(2, slow_workers(100)).await;
    h.scheduler.start().await;

    for i in 0..6 {
        h.scheduler
            .submit(agent_spec(&format!("task {i}")), TaskKind::Agent)
            .await
            .unwrap();
    }

    let db = Arc::clone(&h.db);
    let max_running = tokio::time::timeout(TEST_TIMEOUT, async move {
        let mut max_running = 0;
        loop {
            let jobs = db.list_jobs().await.unwrap();
            let running = jobs
                .iter()
                .filter(|job| job.status == JobStatus::Running)
                .count();
            max_running = max_running.max(running);
            if jobs.iter().all(|job| job.status.is_terminal()) {
                return max_running;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    assert!(max_running <= 2, "saw {max_running} running jobs");
    assert!(h.scheduler.slots().peak() <= 2);
    assert!(h.runtime.peak_running.load(std::sync::atomic::Ordering::SeqCst) <= 2);

    let jobs = h.db.list_jobs().await.unwrap();
    assert!(jobs.iter().all(|job| job.status == JobStatus::Completed));

    let slots = h.scheduler.slots().clone();
    eventually(|| slots.released() == 6).await;
    assert_eq!(slots.in_use(), 0);
}

#[tokio::test]
async fn every_slot_is_released_exactly_once() {
    let h = Harness::new(2, slow_workers(20)).await;
    h.scheduler.start().await;

    let mut ids = Vec::new();
    for i in 0..3 {
        ids.push(
            h.scheduler
                .submit(agent_spec(&format!("agent {i}")), TaskKind::Agent)
                .await
                .unwrap(),
        );
    }
    // No prompt: fails during dispatch.
    for _ in 0..2 {
        ids.push(
            h.scheduler
                .submit(WorkerSpec::default(), TaskKind::Text)
                .await
                .unwrap(),
        );
    }
    ids.push(
        h.scheduler
            .submit(WorkerSpec::default().with_prompt("a cat"), TaskKind::Image)
            .await
            .unwrap(),
    );

    let mut failed = 0;
    for id in &ids {
        let job = h.wait_terminal(*id).await;
        if job.status == JobStatus::Failed {
            failed += 1;
        }
    }
    assert_eq!(failed, 2);

    let slots = h.scheduler.slots().clone();
    eventually(|| slots.released() == ids.len()).await;
    // Give a double release the chance to show up.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(slots.acquired(), ids.len());
    assert_eq!(slots.released(), ids.len());
    assert_eq!(slots.in_use(), 0);
    assert_eq!(slots.available(), 2);
}

#[tokio::test]
async fn jobs_are_admitted_in_submission_order() {
    let h = Harness::new(1, Behavior::default()).await;
    let mut events = h.events.subscribe();

    let mut ids = Vec::new();
    for i in 0..4 {
        ids.push(
            h.scheduler
                .submit(
                    WorkerSpec::default().with_prompt(format!("line {i}")),
                    TaskKind::Text,
                )
                .await
                .unwrap(),
        );
    }
    h.scheduler.start().await;

    let dispatched = tokio::time::timeout(TEST_TIMEOUT, async {
        let mut order = Vec::new();
        while order.len() < ids.len() {
            if let LifecycleEvent::Dispatching { job_id, .. } = events.recv().await.unwrap() {
                order.push(job_id);
            }
        }
        order
    })
    .await
    .unwrap();

    assert_eq!(dispatched, ids);
}

#[tokio::test]
async fn second_job_waits_for_the_first_with_one_slot() {
    let h = Harness::new(1, slow_workers(300)).await;
    h.scheduler.start().await;

    let first = h
        .scheduler
        .submit(agent_spec("first"), TaskKind::Agent)
        .await
        .unwrap();
    let second = h
        .scheduler
        .submit(agent_spec("second"), TaskKind::Agent)
        .await
        .unwrap();

    tokio::time::timeout(TEST_TIMEOUT, async {
        loop {
            // Read the second job before the first: if the second has moved
            // on, the first was already terminal when it was read.
            let b = h.job(second).await;
            let a = h.job(first).await;
            if a.status.is_terminal() {
                break;
            }
            assert_eq!(b.status, JobStatus::Pending, "second job left pending early");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    assert_eq!(h.job(first).await.status, JobStatus::Completed);
    let db = Arc::clone(&h.db);
    wait_for(move || {
        let db = Arc::clone(&db);
        async move {
            db.get_job(second)
                .await
                .ok()
                .filter(|job| job.status != JobStatus::Pending)
        }
    })
    .await;

    let second = h.wait_terminal(second).await;
    assert_eq!(second.status, JobStatus::Completed);
    assert_eq!(second.result.as_deref(), Some("done: second"));
}

#[tokio::test]
async fn cancelling_a_queued_job_fails_it_without_a_slot() {
    let h = Harness::new(1, slow_workers(300)).await;
    h.scheduler.start().await;

    let running = h
        .scheduler
        .submit(agent_spec("long"), TaskKind::Agent)
        .await
        .unwrap();
    let queued = h
        .scheduler
        .submit(agent_spec("never"), TaskKind::Agent)
        .await
        .unwrap();

    assert!(h.scheduler.cancel(queued));
    let cancelled = h.wait_terminal(queued).await;
    assert_eq!(cancelled.status, JobStatus::Failed);
    assert!(cancelled.error.unwrap().contains("cancelled"));
    assert!(cancelled.worker_id.is_none());

    assert_eq!(h.wait_terminal(running).await.status, JobStatus::Completed);
    let slots = h.scheduler.slots().clone();
    eventually(|| slots.released() == 1).await;
    assert_eq!(slots.acquired(), 1);
    assert_eq!(h.runtime.creates.load(std::sync::atomic::Ordering::SeqCst), 1);

    // Finished jobs are no longer tracked.
    eventually(|| !h.scheduler.cancel(running)).await;
}

#[tokio::test]
async fn cancel_of_unknown_job_is_false() {
    let h = Harness::new(1, Behavior::default()).await;
    assert!(!h.scheduler.cancel(aule::worker::JobId::new()));
}

#[tokio::test]
async fn shutdown_tears_down_running_and_keeps_queued_pending() {
    let h = Harness::with(
        1,
        Behavior {
            never_healthy: true,
            ..Default::default()
        },
        |config| config.health.timeout = Duration::from_secs(30),
    )
    .await;
    h.scheduler.start().await;

    let running = h
        .scheduler
        .submit(agent_spec("stuck"), TaskKind::Agent)
        .await
        .unwrap();
    let queued = h
        .scheduler
        .submit(agent_spec("later"), TaskKind::Agent)
        .await
        .unwrap();

    let runtime = Arc::clone(&h.runtime);
    eventually(|| !runtime.container_names().is_empty()).await;

    tokio::time::timeout(TEST_TIMEOUT, h.scheduler.shutdown())
        .await
        .unwrap();

    let job = h.job(running).await;
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error.unwrap().contains("cancelled"));
    assert!(h.runtime.container_names().is_empty());
    assert_eq!(h.job(queued).await.status, JobStatus::Pending);
    assert_eq!(h.scheduler.slots().in_use(), 0);
}

#[tokio::test]
async fn pending_jobs_resume_after_restart() {
    let h = Harness::new(2, Behavior::default()).await;

    let mut earlier = Job::new(WorkerSpec::default().with_prompt("hello"), TaskKind::Text);
    h.db.save_job(&earlier).await.unwrap();
    earlier = h.job(earlier.id).await;
    assert_eq!(earlier.status, JobStatus::Pending);

    h.scheduler.start().await;
    assert_eq!(h.scheduler.resume_pending().await.unwrap(), 1);

    let job = h.wait_terminal(earlier.id).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.result.as_deref(), Some("v1-llm: hello"));
    assert_eq!(h.scheduler.resume_pending().await.unwrap(), 0);
}
