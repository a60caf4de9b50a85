//! Reconciliation store — the local task cache fed by the sync channel.
//!
//! Applies task mutations idempotently with last-writer-wins conflict
//! resolution keyed on the backend's `server_timestamp`, plus delete
//! tombstones so a stale update can never resurrect a removed task. The
//! cache is weakly consistent by design: the CRUD backend stays
//! authoritative, and [`ReconciliationStore::refresh`] is the recovery path
//! after an extended disconnection.
//!
//! Single writer (the pipeline's mutation loop); readers consume published
//! `Arc<[Task]>` snapshots, one assignment per applied event.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::debug;

use crate::events::{MutationKind, Task, TaskMutationEvent};

/// What `apply` did with a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The mutation changed the cache. Carries the mutation kind so the
    /// notification layer knows what to acknowledge.
    Applied(MutationKind),
    /// Older than (or equal to) what the cache already holds; dropped.
    Stale,
    /// The task id is tombstoned (or the delete was a duplicate); dropped.
    Tombstoned,
}

impl ApplyOutcome {
    /// The accepted mutation kind, if the event was applied.
    pub fn accepted(&self) -> Option<MutationKind> {
        match self {
            ApplyOutcome::Applied(kind) => Some(*kind),
            _ => None,
        }
    }
}

struct CacheEntry {
    task: Task,
    /// `server_timestamp` of the mutation that produced this entry.
    applied_at: DateTime<Utc>,
}

/// Read side of the store: latest published snapshot + change signal.
pub type TaskCacheView = watch::Receiver<Arc<[Task]>>;

pub struct ReconciliationStore {
    entries: HashMap<i64, CacheEntry>,
    /// Ids deleted this session. A tombstoned id drops every later
    /// mutation; deletes are terminal until a backend refresh.
    tombstones: HashSet<i64>,
    snapshot_tx: watch::Sender<Arc<[Task]>>,
}

impl Default for ReconciliationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ReconciliationStore {
    pub fn new() -> Self {
        let (snapshot_tx, _) = watch::channel(Arc::from(Vec::new()));
        Self {
            entries: HashMap::new(),
            tombstones: HashSet::new(),
            snapshot_tx,
        }
    }

    /// Subscribe to published snapshots (tasks ordered by id).
    pub fn view(&self) -> TaskCacheView {
        self.snapshot_tx.subscribe()
    }

    pub fn get(&self, id: i64) -> Option<&Task> {
        self.entries.get(&id).map(|e| &e.task)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Apply one mutation. Convergent: the same event twice, or any arrival
    /// order consistent with the timestamps, ends in the same cache state.
    ///
    /// Deletes are unconditional and tombstone the id for the session.
    /// Upserts only win with a strictly newer `server_timestamp`.
    pub fn apply(&mut self, event: &TaskMutationEvent) -> ApplyOutcome {
        let id = event.task.id;

        if event.kind == MutationKind::Deleted {
            let existed = self.entries.remove(&id).is_some();
            let newly_tombstoned = self.tombstones.insert(id);
            if existed {
                self.publish();
            }
            return if newly_tombstoned {
                ApplyOutcome::Applied(MutationKind::Deleted)
            } else {
                debug!(task_id = id, "duplicate delete dropped");
                ApplyOutcome::Tombstoned
            };
        }

        if self.tombstones.contains(&id) {
            debug!(task_id = id, kind = %event.kind, "mutation for tombstoned task dropped");
            return ApplyOutcome::Tombstoned;
        }

        if let Some(entry) = self.entries.get(&id) {
            if event.server_timestamp <= entry.applied_at {
                debug!(task_id = id, kind = %event.kind, "stale mutation dropped");
                return ApplyOutcome::Stale;
            }
        }

        self.entries.insert(
            id,
            CacheEntry {
                task: event.task.clone(),
                applied_at: event.server_timestamp,
            },
        );
        self.publish();
        ApplyOutcome::Applied(event.kind)
    }

    /// Replace the whole cache from an authoritative backend fetch.
    ///
    /// Tombstones are cleared: the backend's answer supersedes anything this
    /// session remembered, including its deletes.
    pub fn refresh(&mut self, tasks: Vec<Task>) {
        self.entries = tasks
            .into_iter()
            .map(|task| {
                let applied_at = task.updated_at;
                (task.id, CacheEntry { task, applied_at })
            })
            .collect();
        self.tombstones.clear();
        self.publish();
    }

    fn publish(&self) {
        let mut tasks: Vec<Task> = self.entries.values().map(|e| e.task.clone()).collect();
        tasks.sort_by_key(|t| t.id);
        self.snapshot_tx.send_replace(tasks.into());
    }
}
