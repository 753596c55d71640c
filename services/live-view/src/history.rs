//! Bounded history of accepted snapshots
//!
//! Keeps up to `capacity` snapshots newest-first. A push is accepted only if
//! its timestamp is strictly newer than the current head, which guards the
//! window against out-of-order and replayed deliveries after a reconnect.
//! Evicted snapshots are gone for good; nothing is persisted.

use serde::{Deserialize, Serialize};
use tracing::debug;
use types::snapshot::{Snapshot, Timestamp};

use crate::config::DEFAULT_HISTORY_CAPACITY;

/// Result of pushing a snapshot into the window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    /// Snapshot became the new head.
    Accepted,
    /// Snapshot was not newer than the head and was ignored.
    Rejected { head: Timestamp },
}

impl PushOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, PushOutcome::Accepted)
    }
}

/// A history entry as presented, with the freshness marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub snapshot: Snapshot,
    /// Set on the head of the window only.
    pub freshest: bool,
}

/// Bounded, newest-first snapshot buffer.
#[derive(Debug, Clone)]
pub struct HistoryWindow {
    /// Newest first.
    snapshots: Vec<Snapshot>,
    capacity: usize,
    accepted: u64,
    rejected: u64,
}

impl HistoryWindow {
    /// Create an empty window. A zero capacity is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            snapshots: Vec::with_capacity(capacity + 1),
            capacity,
            accepted: 0,
            rejected: 0,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }

    /// Push a snapshot, prepending it if strictly newer than the head.
    pub fn push(&mut self, snapshot: Snapshot) -> PushOutcome {
        if let Some(head) = self.snapshots.first() {
            if snapshot.timestamp() <= head.timestamp() {
                self.rejected += 1;
                debug!(
                    head = %head.timestamp(),
                    received = %snapshot.timestamp(),
                    id = %snapshot.id(),
                    "Ignoring snapshot not newer than history head"
                );
                return PushOutcome::Rejected {
                    head: head.timestamp().clone(),
                };
            }
        }

        self.snapshots.insert(0, snapshot);
        self.snapshots.truncate(self.capacity);
        self.accepted += 1;
        PushOutcome::Accepted
    }

    /// Adopt a query result set as the window contents.
    ///
    /// Sorted newest first, duplicate timestamps collapsed to the first seen,
    /// and bounded to the capacity. Returns the number of snapshots kept.
    pub fn adopt(&mut self, mut result_set: Vec<Snapshot>) -> usize {
        result_set.sort_by(|a, b| b.timestamp().cmp(a.timestamp()));
        result_set.dedup_by(|later, earlier| later.timestamp() == earlier.timestamp());
        result_set.truncate(self.capacity);
        self.accepted += result_set.len() as u64;
        self.snapshots = result_set;
        self.snapshots.len()
    }

    /// Current contents, newest first.
    pub fn current(&self) -> &[Snapshot] {
        &self.snapshots
    }

    /// Current contents with the head flagged freshest.
    pub fn entries(&self) -> Vec<HistoryEntry> {
        self.snapshots
            .iter()
            .enumerate()
            .map(|(i, snapshot)| HistoryEntry {
                snapshot: snapshot.clone(),
                freshest: i == 0,
            })
            .collect()
    }

    pub fn head(&self) -> Option<&Snapshot> {
        self.snapshots.first()
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total pushes accepted since creation.
    pub fn accepted(&self) -> u64 {
        self.accepted
    }

    /// Total pushes rejected as stale since creation.
    pub fn rejected(&self) -> u64 {
        self.rejected
    }
}

impl Default for HistoryWindow {
    fn default() -> Self {
        Self::with_defaults()
    }
}
