//! Merge conflict handling tests.
//!
//! Conflicting branches must not stop the batch: the merge is aborted, the
//! next phase starts from the trunk as it was, and the conflict is reported
//! in the final snapshot.

use fanout::core::{BatchPhase, ResolutionMethod, SlotStatus};

use crate::fixtures::{assignment, phase, plan, tasks, Harness, ROADMAP};

// ========== Conflict Tests ==========

/// Test: One phase-1 assignment conflicts
/// Given two parallel assignments writing the same file differently
/// When the batch runs
/// Then the second merge conflicts, phase 2 still runs and the batch completes
#[tokio::test]
async fn test_conflict_does_not_stop_batch() {
    let tasks = tasks(4);
    let harness = Harness::new(&tasks);
    let plan = plan(vec![
        phase(
            1,
            true,
            vec![
                assignment(0, &[0], "write shared.txt from-alpha"),
                assignment(1, &[1], "write shared.txt from-beta"),
                assignment(2, &[2], "write other.txt other"),
            ],
        ),
        phase(
            2,
            false,
            vec![assignment(3, &[3], "require other.txt\nwrite final.txt done")],
        ),
    ]);

    let batch = harness.run(plan, tasks, 3).await;

    assert_eq!(batch.phase, BatchPhase::Complete);
    assert_eq!(batch.merge_results.len(), 4);

    let methods: Vec<ResolutionMethod> = batch
        .merge_results
        .iter()
        .map(|m| m.resolution_method)
        .collect();
    assert_eq!(
        methods,
        vec![
            ResolutionMethod::Clean,
            ResolutionMethod::Conflict,
            ResolutionMethod::Clean,
            ResolutionMethod::Clean,
        ]
    );

    let conflict = &batch.merge_results[1];
    assert!(!conflict.success);
    assert!(conflict.branch_name.ends_with("/1"));
    assert_eq!(conflict.conflict_files, vec!["shared.txt".to_string()]);
    assert!(conflict.message.contains("branch tip was"));

    let error = batch.error.expect("informational error");
    assert!(error.starts_with("Completed with conflicts"), "{}", error);

    assert_eq!(harness.repo.read_file("shared.txt").as_deref(), Some("from-alpha\n"));
    assert!(harness.repo.read_file("final.txt").is_some());
    assert!(batch.verification.is_none(), "verification is skipped on conflicts");
    assert_eq!(harness.repo.git(&["status", "--porcelain", "--untracked-files=no"]), "");
}

/// Test: A conflicted task is not marked complete
#[tokio::test]
async fn test_conflicted_task_is_not_marked() {
    let tasks = tasks(2);
    let harness = Harness::new(&tasks);
    let plan = plan(vec![phase(
        1,
        true,
        vec![
            assignment(0, &[0], "write clash.txt left"),
            assignment(1, &[1], "write clash.txt right"),
        ],
    )]);

    let batch = harness.run(plan, tasks, 2).await;

    assert_eq!(batch.phase, BatchPhase::Complete);
    let slot = batch.slots.iter().find(|s| s.task_index == 1).unwrap();
    assert_eq!(slot.status, SlotStatus::Succeeded);
    assert!(slot.error.as_deref().unwrap_or_default().starts_with("Not merged"));

    let roadmap = harness.repo.read_file(ROADMAP).unwrap();
    assert!(roadmap.contains("- [x] Task 0"));
    assert!(roadmap.contains("- [ ] Task 1"));
    assert!(batch.finalize_message.unwrap().contains("Marked 1 item(s)"));
}

/// Test: Merge order follows assignment declaration, not completion order
/// Given the first-declared assignment finishes last
/// When both write the same file
/// Then the first-declared assignment's content wins
#[tokio::test]
async fn test_merge_order_is_declaration_order() {
    let tasks = tasks(2);
    let harness = Harness::new(&tasks);
    let plan = plan(vec![phase(
        1,
        true,
        vec![
            assignment(0, &[0], "sleep 200\nwrite order.txt first-declared"),
            assignment(1, &[1], "write order.txt second-declared"),
        ],
    )]);

    let batch = harness.run(plan, tasks, 2).await;

    assert_eq!(batch.phase, BatchPhase::Complete);
    assert!(batch.merge_results[0].success);
    assert!(batch.merge_results[0].branch_name.ends_with("/0"));
    assert_eq!(batch.merge_results[1].resolution_method, ResolutionMethod::Conflict);
    assert_eq!(harness.repo.read_file("order.txt").as_deref(), Some("first-declared\n"));
}
