//! Cancellation and concurrency bound tests.

use std::time::Duration;

use fanout::core::{BatchId, BatchPhase, SlotStatus};

use crate::fixtures::{assignment, phase, plan, tasks, Harness};

// ========== Cancellation Tests ==========

/// Test: Cancel mid-phase
/// Given a parallel phase serialized to one worker and a second phase
/// When the batch is cancelled while the first assignment runs
/// Then the running slot finishes, pending slots are cancelled and the batch ends cancelled
#[tokio::test]
async fn test_cancel_mid_phase() {
    let tasks = tasks(4);
    let harness = Harness::new(&tasks);
    let plan = plan(vec![
        phase(
            1,
            true,
            vec![
                assignment(0, &[0], "sleep 400\nwrite c0.txt 0"),
                assignment(1, &[1], "sleep 400\nwrite c1.txt 1"),
                assignment(2, &[2], "sleep 400\nwrite c2.txt 2"),
            ],
        ),
        phase(2, false, vec![assignment(3, &[3], "write c3.txt 3")]),
    ]);

    let id = harness
        .engine
        .approve_and_execute(plan, tasks, Some(1))
        .await
        .unwrap();
    harness
        .wait_until(&id, Duration::from_secs(10), |b| {
            b.slots.iter().any(|s| s.status == SlotStatus::Running)
        })
        .await;
    harness.engine.cancel(id.as_str()).await.unwrap();

    let batch = harness.engine.wait_for_batch(&id).await.unwrap();

    assert_eq!(batch.phase, BatchPhase::Cancelled);
    assert_eq!(harness.runner.total_dispatches(), 1);
    assert_eq!(batch.slots[0].status, SlotStatus::Succeeded);
    for slot in &batch.slots[1..] {
        assert_eq!(slot.status, SlotStatus::Cancelled, "task {}", slot.task_index);
    }
    assert_eq!(batch.count_status(SlotStatus::Pending), 0);

    assert_eq!(batch.merge_results.len(), 1);
    assert!(harness.repo.read_file("c0.txt").is_some());
    assert!(batch.verification.is_none());
    assert!(batch.finalize_message.is_none());
    assert!(harness.repo.branches("parallel/*").is_empty());
    assert_eq!(harness.repo.linked_worktrees(), 0);
    assert!(harness.engine.lease_holder().await.is_none());
}

/// Test: Cancelling unknown ids is reported
#[tokio::test]
async fn test_cancel_unknown_ids() {
    let harness = Harness::new(&tasks(1));
    let unknown = BatchId::generate();
    assert!(matches!(
        harness.engine.cancel(unknown.as_str()).await,
        Err(fanout::Error::BatchNotFound(_))
    ));
    assert!(harness.engine.cancel("not-an-id").await.is_err());
    assert!(matches!(
        harness.engine.cancel("plan-000000000000").await,
        Err(fanout::Error::PlanJobNotFound(_))
    ));
}

// ========== Concurrency Bound Tests ==========

/// Test: maxConcurrency=1 serializes a parallel phase
#[tokio::test]
async fn test_max_concurrency_one_serializes() {
    let tasks = tasks(4);
    let harness = Harness::new(&tasks);
    let assignments = (0..4)
        .map(|i| assignment(i as u32, &[i], &format!("sleep 50\nwrite s{}.txt {}", i, i)))
        .collect();
    let plan = plan(vec![phase(1, true, assignments)]);

    let batch = harness.run(plan, tasks, 1).await;

    assert_eq!(batch.phase, BatchPhase::Complete);
    assert_eq!(batch.max_concurrency, 1);
    assert_eq!(harness.runner.max_concurrency(), 1);
    assert_eq!(batch.count_status(SlotStatus::Succeeded), 4);
}

/// Test: Parallel dispatch is bounded by maxConcurrency
#[tokio::test]
async fn test_parallel_dispatch_is_bounded() {
    let tasks = tasks(5);
    let harness = Harness::new(&tasks);
    let assignments = (0..5)
        .map(|i| assignment(i as u32, &[i], &format!("sleep 200\nwrite p{}.txt {}", i, i)))
        .collect();
    let plan = plan(vec![phase(1, true, assignments)]);

    let batch = harness.run(plan, tasks, 2).await;

    assert_eq!(batch.phase, BatchPhase::Complete);
    assert_eq!(harness.runner.max_concurrency(), 2);
    assert_eq!(batch.merge_results.len(), 5);
}

/// Test: Requested concurrency is clamped into 1..=8
#[tokio::test]
async fn test_requested_concurrency_is_clamped() {
    let tasks = tasks(1);
    let harness = Harness::new(&tasks);
    let plan = plan(vec![phase(1, false, vec![assignment(0, &[0], "write k.txt k")])]);

    let batch = harness.run(plan, tasks, 50).await;

    assert_eq!(batch.max_concurrency, 8);
}
