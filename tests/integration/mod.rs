//! Integration test suite for fanout.
//!
//! These tests run whole batches against real temporary git repositories.
//! Agents and the planning collaborator are scripted, so no external CLI is
//! invoked.
//!
//! # Test Categories
//!
//! - `batch_execution`: end-to-end phase, merge and finalize behavior
//! - `merge_conflicts`: conflicting branches and the trunk after an aborted merge
//! - `attempts`: retry budget, quota handling and idempotent re-runs
//! - `cancellation`: cooperative cancel and the concurrency bound
//! - `workspaces`: workspace lifecycle and orphan cleanup
//! - `planning`: plan jobs, replanning and approval


mod attempts;
mod batch_execution;
mod cancellation;
mod merge_conflicts;
mod planning;
