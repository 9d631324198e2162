//! Read-side projection of running and recently finished batches.
//!
//! The orchestrator publishes a full `Batch` copy after every state change.
//! Pollers only ever see those copies, so a client that reconnects sees the
//! same thing it would have seen live.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::RwLock;

use crate::core::{Batch, BatchId};
use crate::flog_debug;

#[derive(Debug, Clone, PartialEq)]
pub enum BatchLookup {
    /// Registered, but the orchestrator has not published yet.
    NotInitialized,
    NotFound,
    Snapshot(Box<Batch>),
}

impl BatchLookup {
    pub fn snapshot(self) -> Option<Batch> {
        match self {
            BatchLookup::Snapshot(batch) => Some(*batch),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct StatusProjector {
    entries: Arc<RwLock<HashMap<BatchId, Option<Batch>>>>,
}

impl StatusProjector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve an id so lookups report `NotInitialized` instead of `NotFound`.
    pub async fn register(&self, id: &BatchId) {
        self.entries.write().await.entry(id.clone()).or_insert(None);
    }

    pub async fn publish(&self, batch: &Batch) {
        flog_debug!(
            "publish {} phase={} current_phase={:?}",
            batch.id,
            batch.phase,
            batch.current_phase_id
        );
        self.entries
            .write()
            .await
            .insert(batch.id.clone(), Some(batch.clone()));
    }

    pub async fn lookup(&self, id: &BatchId) -> BatchLookup {
        match self.entries.read().await.get(id) {
            None => BatchLookup::NotFound,
            Some(None) => BatchLookup::NotInitialized,
            Some(Some(batch)) => BatchLookup::Snapshot(Box::new(batch.clone())),
        }
    }

    pub async fn batch_ids(&self) -> Vec<BatchId> {
        let mut ids: Vec<BatchId> = self.entries.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Drop terminal batches that finished more than `retention` ago.
    pub async fn purge_finished(&self, retention: Duration) -> Vec<BatchId> {
        let Some(cutoff) = chrono::Duration::from_std(retention)
            .ok()
            .and_then(|d| Utc::now().checked_sub_signed(d))
        else {
            return Vec::new();
        };
        let mut entries = self.entries.write().await;
        let expired: Vec<BatchId> = entries
            .iter()
            .filter_map(|(id, batch)| {
                let batch = batch.as_ref()?;
                let finished = batch.finished_at?;
                (batch.phase.is_terminal() && finished <= cutoff).then(|| id.clone())
            })
            .collect();
        for id in &expired {
            entries.remove(id);
        }
        expired
    }
}
