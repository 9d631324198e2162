//! Plan job tests: planning, replanning, approval and cancellation.

use std::time::Duration;

use fanout::core::BatchPhase;
use fanout::{Engine, Error, PlanJob, PlanJobStatus};

use crate::fixtures::{assignment, phase, plan, tasks, Harness, ScriptedCollaborator};

async fn wait_for_plan(engine: &Engine, id: &str) -> PlanJob {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let job = engine.plan_status(id).await.unwrap();
        if job.status != PlanJobStatus::Running {
            return job;
        }
        assert!(tokio::time::Instant::now() < deadline, "plan job {} still running", id);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ========== Planning Tests ==========

/// Test: A plan job completes with the collaborator's plan
/// Given a collaborator plan that leaves one task unassigned
/// When planning finishes
/// Then the job is complete and the plan carries a coverage warning
#[tokio::test]
async fn test_start_planning_completes() {
    let tasks = tasks(3);
    let scripted = plan(vec![phase(
        1,
        true,
        vec![
            assignment(0, &[0], "write a.txt a"),
            assignment(1, &[1], "write b.txt b"),
        ],
    )]);
    let harness = Harness::with_collaborator(&tasks, ScriptedCollaborator::new(Some(scripted)));

    let id = harness
        .engine
        .start_planning(tasks.clone(), "Milestone 1")
        .await
        .unwrap();
    assert!(id.starts_with("plan-"));
    let job = wait_for_plan(&harness.engine, &id).await;

    assert_eq!(job.status, PlanJobStatus::Complete);
    let plan = job.plan.expect("plan");
    assert_eq!(plan.assignment_count(), 2);
    assert!(plan
        .warnings
        .iter()
        .any(|w| w.starts_with("Tasks not assigned to any agent")));
    assert!(job.output_tail.is_some());
    assert!(!job.approved);

    let requests = harness.collaborator.plan_requests.lock().unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].tasks, tasks);
    assert_eq!(requests[0].milestone, "Milestone 1");
    assert!(requests[0].project_context.contains("- [ ] Task 2"));
    assert!(!requests[0].is_replan());
}

/// Test: Collaborator failures fail the job
#[tokio::test]
async fn test_planning_failure_is_reported() {
    let tasks = tasks(1);
    let harness = Harness::new(&tasks);

    let id = harness.engine.start_planning(tasks, "").await.unwrap();
    let job = wait_for_plan(&harness.engine, &id).await;

    assert_eq!(job.status, PlanJobStatus::Failed);
    assert!(job.plan.is_none());
    assert!(job.error.unwrap().contains("no plan scripted"));
}

/// Test: Planning refuses a dirty tree
#[tokio::test]
async fn test_planning_requires_clean_tree() {
    let tasks = tasks(1);
    let harness = Harness::new(&tasks);
    harness.repo.write_file("README.md", "changed\n");

    let result = harness.engine.start_planning(tasks, "").await;

    match result {
        Err(Error::Precondition { dirty_files }) => {
            assert_eq!(dirty_files, vec!["README.md".to_string()])
        }
        other => panic!("expected precondition error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_plan_status_unknown_job() {
    let harness = Harness::new(&tasks(1));
    assert!(matches!(
        harness.engine.plan_status("plan-abcdefabcdef").await,
        Err(Error::PlanJobNotFound(_))
    ));
}

// ========== Replan and Approval Tests ==========

/// Test: Replanning before approval, locked after
/// Given a completed plan job
/// When it is replanned, approved, and replanned again
/// Then the first replan carries the feedback and the second is refused
#[tokio::test]
async fn test_replan_then_approve_locks_job() {
    let tasks = tasks(2);
    let scripted = plan(vec![phase(
        1,
        true,
        vec![
            assignment(0, &[0], "write r0.txt 0"),
            assignment(1, &[1], "write r1.txt 1"),
        ],
    )]);
    let harness = Harness::with_collaborator(&tasks, ScriptedCollaborator::new(Some(scripted)));

    let first = harness.engine.start_planning(tasks, "").await.unwrap();
    let job = wait_for_plan(&harness.engine, &first).await;
    let previous = job.plan.unwrap();

    let second = harness
        .engine
        .replan(&first, previous.clone(), "Split the work differently")
        .await
        .unwrap();
    assert_ne!(first, second);
    let revised = wait_for_plan(&harness.engine, &second).await;
    assert_eq!(revised.status, PlanJobStatus::Complete);
    {
        let requests = harness.collaborator.plan_requests.lock().unwrap();
        let last = requests.last().unwrap();
        assert!(last.is_replan());
        assert_eq!(last.previous_plan.as_ref(), Some(&previous));
        assert_eq!(last.feedback.as_deref(), Some("Split the work differently"));
        assert_eq!(last.tasks.len(), 2);
    }

    let batch_id = harness.engine.approve_job(&second, Some(2)).await.unwrap();
    assert!(harness.engine.plan_status(&second).await.unwrap().approved);
    assert!(matches!(
        harness.engine.replan(&second, previous, "again").await,
        Err(Error::PlanLocked(_))
    ));
    assert!(matches!(
        harness.engine.approve_job(&second, None).await,
        Err(Error::PlanLocked(_))
    ));

    let batch = harness.engine.wait_for_batch(&batch_id).await.unwrap();
    assert_eq!(batch.phase, BatchPhase::Complete);
    assert_eq!(batch.max_concurrency, 2);
}

/// Test: Cancelling a running plan job
#[tokio::test]
async fn test_cancel_plan_job() {
    let tasks = tasks(1);
    let scripted = plan(vec![phase(1, false, vec![assignment(0, &[0], "noop")])]);
    let harness = Harness::with_collaborator(
        &tasks,
        ScriptedCollaborator::slow(scripted, Duration::from_secs(5)),
    );

    let id = harness.engine.start_planning(tasks, "").await.unwrap();
    harness.engine.cancel(&id).await.unwrap();

    let job = harness.engine.plan_status(&id).await.unwrap();
    assert_eq!(job.status, PlanJobStatus::Failed);
    assert_eq!(job.error.as_deref(), Some("Cancelled by user"));
    assert!(matches!(
        harness.engine.approve_job(&id, None).await,
        Err(Error::InvalidPlan(_))
    ));
}
