//! Attempt budget tests.
//!
//! Each assignment gets at most three dispatches, quota exhaustion is never
//! retried, and a no-op success only counts when its output already exists.

use fanout::core::{BatchPhase, ResolutionMethod, SlotStatus};
use fanout::orchestration::MAX_ATTEMPTS;

use crate::fixtures::{assignment, phase, plan, tasks, Harness, ROADMAP};

// ========== Retry Tests ==========

/// Test: A flaky assignment succeeds on its second attempt
#[tokio::test]
async fn test_flaky_assignment_retries_once() {
    let tasks = tasks(1);
    let harness = Harness::new(&tasks);
    let plan = plan(vec![phase(
        1,
        false,
        vec![assignment(0, &[0], "flaky\nwrite retry.txt ok")],
    )]);

    let batch = harness.run(plan, tasks, 3).await;

    assert_eq!(batch.phase, BatchPhase::Complete);
    assert_eq!(harness.runner.attempts_for("flaky"), 2);
    let slot = &batch.slots[0];
    assert_eq!(slot.status, SlotStatus::Succeeded);
    assert_eq!(slot.attempts, 2);
    assert!(slot.error.is_none());
}

/// Test: Stray files from a failed attempt are discarded before the retry
#[tokio::test]
async fn test_workspace_reset_between_attempts() {
    let tasks = tasks(1);
    let harness = Harness::new(&tasks);
    let plan = plan(vec![phase(
        1,
        false,
        vec![assignment(0, &[0], "litter junk.txt\nflaky\nwrite keep.txt kept")],
    )]);

    let batch = harness.run(plan, tasks, 3).await;

    assert_eq!(batch.phase, BatchPhase::Complete);
    assert!(harness.repo.read_file("keep.txt").is_some());
    assert!(harness.repo.read_file("junk.txt").is_none());
}

/// Test: A failing assignment uses the whole budget and fails alone
/// Given three parallel assignments, one of which always fails
/// When the batch runs
/// Then it is dispatched three times, its siblings merge and the batch completes
#[tokio::test]
async fn test_failing_assignment_exhausts_attempts() {
    let tasks = tasks(3);
    let harness = Harness::new(&tasks);
    let plan = plan(vec![phase(
        1,
        true,
        vec![
            assignment(0, &[0], "write ok0.txt 0"),
            assignment(1, &[1], "fail"),
            assignment(2, &[2], "write ok2.txt 2"),
        ],
    )]);

    let batch = harness.run(plan, tasks, 3).await;

    assert_eq!(batch.phase, BatchPhase::Complete);
    assert_eq!(harness.runner.attempts_for("fail"), MAX_ATTEMPTS);

    let failed = batch.slots.iter().find(|s| s.task_index == 1).unwrap();
    assert_eq!(failed.status, SlotStatus::Failed);
    assert_eq!(failed.attempts, MAX_ATTEMPTS);
    assert_eq!(failed.error.as_deref(), Some("scripted failure"));
    assert_eq!(failed.output_tail.as_deref(), Some("boom"));

    assert_eq!(batch.merge_results.len(), 2);
    assert!(batch.merge_results.iter().all(|m| m.success));
    assert!(harness.repo.branches("parallel/*").is_empty());

    let error = batch.error.expect("informational error");
    assert!(error.starts_with("Completed with failures"), "{}", error);
    assert!(error.contains("1 task(s) failed"));

    let roadmap = harness.repo.read_file(ROADMAP).unwrap();
    assert!(roadmap.contains("- [x] Task 0"));
    assert!(roadmap.contains("- [ ] Task 1"));
    assert!(roadmap.contains("- [x] Task 2"));
}

/// Test: Quota exhaustion is never retried
#[tokio::test]
async fn test_quota_exhaustion_is_not_retried() {
    let tasks = tasks(2);
    let harness = Harness::new(&tasks);
    let plan = plan(vec![phase(
        1,
        true,
        vec![
            assignment(0, &[0], "quota"),
            assignment(1, &[1], "write fine.txt fine"),
        ],
    )]);

    let batch = harness.run(plan, tasks, 3).await;

    assert_eq!(batch.phase, BatchPhase::Complete);
    assert_eq!(harness.runner.attempts_for("quota"), 1);
    let slot = batch.slots.iter().find(|s| s.task_index == 0).unwrap();
    assert_eq!(slot.status, SlotStatus::Failed);
    assert_eq!(slot.attempts, 1);
    assert!(slot.error.as_deref().unwrap().contains("usage limit"));
}

// ========== No-op Success Tests ==========

/// Test: Success without changes and without expected output is a failure
#[tokio::test]
async fn test_noop_success_without_output_fails() {
    let tasks = tasks(1);
    let harness = Harness::new(&tasks);
    let plan = plan(vec![phase(1, false, vec![assignment(0, &[0], "noop")])]);

    let batch = harness.run(plan, tasks, 3).await;

    assert_eq!(batch.phase, BatchPhase::Complete);
    assert_eq!(harness.runner.attempts_for("noop"), MAX_ATTEMPTS);
    let slot = &batch.slots[0];
    assert_eq!(slot.status, SlotStatus::Failed);
    assert_eq!(
        slot.error.as_deref(),
        Some("Agent reported success but made no changes")
    );
    assert!(batch.merge_results.is_empty());
}

/// Test: Re-running work that already exists succeeds on the first attempt
/// Given the files a prompt names are already on the trunk
/// When the agent succeeds without changing anything
/// Then the assignment succeeds without a retry
#[tokio::test]
async fn test_existing_output_counts_as_success() {
    let tasks = tasks(1);
    let harness = Harness::new(&tasks);
    harness.repo.create_and_commit(
        "docs/guide.md",
        &"Guide content that is clearly more than trivial.\n".repeat(3),
        "Add guide",
    );
    let plan = plan(vec![phase(
        1,
        false,
        vec![assignment(0, &[0], "noop\nWrite docs/guide.md")],
    )]);

    let batch = harness.run(plan, tasks, 3).await;

    assert_eq!(batch.phase, BatchPhase::Complete);
    assert_eq!(harness.runner.attempts_for("noop"), 1);
    assert_eq!(batch.slots[0].status, SlotStatus::Succeeded);
    assert_eq!(batch.merge_results.len(), 1);
    assert_eq!(batch.merge_results[0].resolution_method, ResolutionMethod::Clean);
    assert!(harness
        .repo
        .read_file(ROADMAP)
        .unwrap()
        .contains("- [x] Task 0"));
}
