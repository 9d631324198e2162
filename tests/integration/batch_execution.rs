//! End-to-end batch tests.
//!
//! These tests approve a plan, let the batch run to a terminal phase and
//! check the trunk, the tracking document and the final snapshot.

use std::time::Duration;

use fanout::core::{BatchPhase, ResolutionMethod, SlotStatus};
use fanout::BatchLookup;

use crate::fixtures::{assignment, phase, plan, tasks, Harness, ScriptedCollaborator, ROADMAP};

// ========== Scenario Tests ==========

/// Test: Two parallel phases (3 and 2 assignments) all succeed
/// Given a plan whose assignments each write one file
/// When the batch runs
/// Then 5 clean merges land on the trunk and the batch completes
#[tokio::test]
async fn test_two_parallel_phases_all_succeed() {
    let tasks = tasks(5);
    let harness = Harness::new(&tasks);
    let plan = plan(vec![
        phase(
            1,
            true,
            vec![
                assignment(0, &[0], "write a.txt alpha"),
                assignment(1, &[1], "write b.txt bravo"),
                assignment(2, &[2], "write c.txt charlie"),
            ],
        ),
        phase(
            2,
            true,
            vec![
                assignment(3, &[3], "require a.txt\nwrite d.txt delta"),
                assignment(4, &[4], "require c.txt\nwrite e.txt echo"),
            ],
        ),
    ]);

    let batch = harness.run(plan, tasks, 3).await;

    assert_eq!(batch.phase, BatchPhase::Complete, "error: {:?}", batch.error);
    assert_eq!(batch.merge_results.len(), 5);
    assert!(batch
        .merge_results
        .iter()
        .all(|m| m.success && m.resolution_method == ResolutionMethod::Clean));
    assert_eq!(batch.count_status(SlotStatus::Succeeded), 5);
    assert!(batch.error.is_none());
    assert_eq!(batch.current_phase_id, Some(2));
    assert!((batch.total_cost - 2.5).abs() < 1e-9);
    assert!(batch.finished_at.is_some());

    for (file, content) in [("a.txt", "alpha"), ("b.txt", "bravo"), ("e.txt", "echo")] {
        assert_eq!(harness.repo.read_file(file).as_deref(), Some(format!("{}\n", content).as_str()));
    }
    assert_eq!(harness.repo.current_branch(), "main");

    let verification = batch.verification.expect("verification should run");
    assert!(verification.overall_pass);
    assert_eq!(harness.collaborator.verify_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
}

/// Test: Finalize marks the tracking document and commits once
#[tokio::test]
async fn test_finalize_marks_tracking_and_commits() {
    let tasks = tasks(2);
    let harness = Harness::new(&tasks);
    let plan = plan(vec![phase(
        1,
        true,
        vec![
            assignment(0, &[0], "write one.txt 1"),
            assignment(1, &[1], "write two.txt 2"),
        ],
    )]);

    let batch = harness.run(plan, tasks, 2).await;

    assert_eq!(batch.phase, BatchPhase::Complete);
    let roadmap = harness.repo.read_file(ROADMAP).unwrap();
    assert!(roadmap.contains("- [x] Task 0"));
    assert!(roadmap.contains("- [x] Task 1"));

    let subjects = harness.repo.commit_subjects();
    assert_eq!(subjects[0], "feat(parallel): Test batch");
    assert!(subjects
        .iter()
        .any(|s| s.starts_with("Merge branch 'parallel/")));
    assert!(subjects
        .iter()
        .any(|s| s.starts_with(&format!("Agent work for batch {}", batch.id))));

    let message = batch.finalize_message.unwrap();
    assert!(message.starts_with("Committed as "), "{}", message);
    assert!(message.ends_with("Marked 2 item(s) complete."), "{}", message);
    assert_eq!(harness.repo.git(&["status", "--porcelain", "--untracked-files=no"]), "");
}

/// Test: Verification dispatch error
/// Given a collaborator whose verification call fails
/// When the batch runs
/// Then verification is an empty failing result and finalization still runs
#[tokio::test]
async fn test_verification_error_still_finalizes() {
    let tasks = tasks(2);
    let harness = Harness::with_collaborator(&tasks, ScriptedCollaborator::failing_verification());
    let plan = plan(vec![phase(
        1,
        true,
        vec![
            assignment(0, &[0], "write x.txt x"),
            assignment(1, &[1], "write y.txt y"),
        ],
    )]);

    let batch = harness.run(plan, tasks, 3).await;

    assert_eq!(batch.phase, BatchPhase::Complete);
    let verification = batch.verification.expect("verification result recorded");
    assert!(!verification.overall_pass);
    assert!(verification.criteria_results.is_empty());
    assert!(verification.summary.contains("verifier crashed"));

    let roadmap = harness.repo.read_file(ROADMAP).unwrap();
    assert!(roadmap.contains("- [x] Task 0"));
    assert!(roadmap.contains("- [x] Task 1"));
    assert!(batch
        .finalize_message
        .unwrap()
        .contains("Verification noted issues:"));
}

/// Test: Dirty tree at execute time
/// Given a modified tracked file
/// When a batch is approved
/// Then it fails immediately without creating workspaces
#[tokio::test]
async fn test_dirty_tree_fails_without_workspaces() {
    let tasks = tasks(2);
    let harness = Harness::new(&tasks);
    harness.repo.write_file("README.md", "# Edited but not committed\n");
    let plan = plan(vec![phase(
        1,
        true,
        vec![
            assignment(0, &[0], "write x.txt x"),
            assignment(1, &[1], "write y.txt y"),
        ],
    )]);

    let batch = harness.run(plan, tasks, 3).await;

    assert_eq!(batch.phase, BatchPhase::Failed);
    let error = batch.error.expect("error recorded");
    assert!(error.contains("README.md"), "{}", error);
    assert_eq!(harness.runner.total_dispatches(), 0);
    assert!(batch.merge_results.is_empty());
    assert!(batch.slots.iter().all(|s| s.status == SlotStatus::Pending));
    assert!(harness.repo.branches("parallel/*").is_empty());
    assert_eq!(harness.repo.linked_worktrees(), 0);
    assert!(harness.engine.lease_holder().await.is_none());
}

/// Test: Untracked files do not block execution
#[tokio::test]
async fn test_untracked_files_are_allowed() {
    let tasks = tasks(1);
    let harness = Harness::new(&tasks);
    harness.repo.write_file("scratch/notes.md", "personal notes\n");
    let plan = plan(vec![phase(1, false, vec![assignment(0, &[0], "write z.txt z")])]);

    let batch = harness.run(plan, tasks, 3).await;

    assert_eq!(batch.phase, BatchPhase::Complete, "error: {:?}", batch.error);
}

// ========== Phase Ordering Tests ==========

/// Test: Sequential phase shares one workspace
/// Given a sequential phase with two assignments
/// When the second depends on the first's output
/// Then both run in the same workspace and one merge is recorded
#[tokio::test]
async fn test_sequential_phase_shares_workspace() {
    let tasks = tasks(2);
    let harness = Harness::new(&tasks);
    let plan = plan(vec![phase(
        1,
        false,
        vec![
            assignment(0, &[0], "write models.txt model"),
            assignment(1, &[1], "require models.txt\nwrite views.txt view"),
        ],
    )]);

    let batch = harness.run(plan, tasks, 3).await;

    assert_eq!(batch.phase, BatchPhase::Complete, "error: {:?}", batch.error);
    assert_eq!(batch.count_status(SlotStatus::Succeeded), 2);
    assert_eq!(batch.merge_results.len(), 1);
    assert_eq!(harness.runner.workspaces_used().len(), 1);
    assert!(harness.repo.read_file("views.txt").is_some());
}

/// Test: Observed phase ids never decrease
#[tokio::test]
async fn test_polled_phase_ids_are_non_decreasing() {
    let tasks = tasks(3);
    let harness = Harness::new(&tasks);
    let plan = plan(vec![
        phase(1, false, vec![assignment(0, &[0], "sleep 50\nwrite p1.txt 1")]),
        phase(2, false, vec![assignment(1, &[1], "sleep 50\nwrite p2.txt 2")]),
        phase(3, false, vec![assignment(2, &[2], "sleep 50\nwrite p3.txt 3")]),
    ]);

    let id = harness
        .engine
        .approve_and_execute(plan, tasks, Some(1))
        .await
        .unwrap();

    let mut observed = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    loop {
        if let BatchLookup::Snapshot(batch) = harness.engine.poll_batch_status(&id).await {
            if let Some(phase_id) = batch.current_phase_id {
                observed.push(phase_id);
            }
            if batch.phase.is_terminal() {
                assert_eq!(batch.phase, BatchPhase::Complete);
                break;
            }
        }
        assert!(tokio::time::Instant::now() < deadline, "batch did not finish");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert!(observed.windows(2).all(|w| w[0] <= w[1]), "{:?}", observed);
    assert_eq!(observed.last(), Some(&3));
}

// ========== Status and Lease Tests ==========

/// Test: Unknown ids are reported as not found
#[tokio::test]
async fn test_poll_unknown_batch() {
    let harness = Harness::new(&tasks(1));
    let id = fanout::core::BatchId::generate();
    assert_eq!(harness.engine.poll_batch_status(&id).await, BatchLookup::NotFound);
}

/// Test: The repository lease is held while a batch runs
/// Given a running batch
/// When a second batch is approved
/// Then it is refused, and the lease is free once the first finishes
#[tokio::test]
async fn test_lease_blocks_second_batch() {
    let tasks = tasks(1);
    let harness = Harness::new(&tasks);
    let slow = plan(vec![phase(1, false, vec![assignment(0, &[0], "sleep 300\nwrite s.txt s")])]);

    let id = harness
        .engine
        .approve_and_execute(slow.clone(), tasks.clone(), None)
        .await
        .unwrap();
    assert_eq!(harness.engine.lease_holder().await, Some(id.clone()));

    let second = harness.engine.approve_and_execute(slow, tasks, None).await;
    assert!(matches!(second, Err(fanout::Error::LeaseHeld { .. })));

    let batch = harness.engine.wait_for_batch(&id).await.unwrap();
    assert_eq!(batch.phase, BatchPhase::Complete);
    assert!(harness.engine.lease_holder().await.is_none());
}

/// Test: Invalid plans are rejected before a batch exists
#[tokio::test]
async fn test_invalid_plan_is_rejected() {
    let tasks = tasks(2);
    let harness = Harness::new(&tasks);
    let bad = plan(vec![phase(1, true, vec![assignment(0, &[7], "write x.txt x")])]);

    let result = harness.engine.approve_and_execute(bad, tasks, None).await;

    assert!(matches!(result, Err(fanout::Error::InvalidPlan(_))));
    assert!(harness.engine.lease_holder().await.is_none());
}

/// Test: Two assignments sharing an id in one phase are refused
/// Given a parallel phase whose assignments both use id 7
/// When the plan is approved
/// Then nothing runs and no task is marked complete
#[tokio::test]
async fn test_duplicate_assignment_ids_are_rejected() {
    let tasks = tasks(2);
    let harness = Harness::new(&tasks);
    let bad = plan(vec![phase(
        1,
        true,
        vec![
            assignment(7, &[0], "write a.txt a"),
            assignment(7, &[1], "write b.txt b"),
        ],
    )]);

    let result = harness.engine.approve_and_execute(bad, tasks, None).await;

    assert!(matches!(result, Err(fanout::Error::InvalidPlan(_))));
    assert_eq!(harness.runner.total_dispatches(), 0);
    assert!(harness.repo.read_file(ROADMAP).unwrap().contains("- [ ] Task 1"));
    assert!(harness.engine.lease_holder().await.is_none());
}

/// Test: A terminal snapshot is only published once the batch has let go
/// Given a running batch polled continuously
/// When the first terminal snapshot is seen
/// Then its branches and worktrees are already gone and orphan cleanup is allowed
#[tokio::test]
async fn test_terminal_snapshot_follows_cleanup() {
    let tasks = tasks(2);
    let harness = Harness::new(&tasks);
    let plan = plan(vec![phase(
        1,
        true,
        vec![
            assignment(0, &[0], "sleep 100\nwrite t0.txt 0"),
            assignment(1, &[1], "sleep 100\nwrite t1.txt 1"),
        ],
    )]);

    let id = harness
        .engine
        .approve_and_execute(plan, tasks, Some(2))
        .await
        .unwrap();
    let batch = harness
        .wait_until(&id, Duration::from_secs(10), |b| b.phase.is_terminal())
        .await;

    assert_eq!(batch.phase, BatchPhase::Complete);
    assert!(harness.repo.branches("parallel/*").is_empty());
    assert_eq!(harness.repo.linked_worktrees(), 0);
    assert!(harness.engine.lease_holder().await.is_none());
    assert!(harness.engine.cleanup_orphans().await.unwrap().is_empty());
}
