use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::error::FlowError;
use crate::task::{ContextValue, Task};

/// Process-local task registry.
///
/// Each task sits behind its own async mutex: updates on one id never
/// interleave, and readers of distinct tasks never block each other. No
/// lock is ever held across a model or warehouse call: callers take
/// snapshots and write back through `update`.
pub struct TaskStore {
    tasks: DashMap<String, Arc<Mutex<Task>>>,
    /// fingerprint → task id, maintained for request coalescing. Entries are
    /// released when their task reaches a terminal status.
    by_fingerprint: DashMap<String, String>,
    next_id: AtomicU64,
    max_revisions: u32,
}

impl TaskStore {
    pub fn new(max_revisions: u32) -> Self {
        Self {
            tasks: DashMap::new(),
            by_fingerprint: DashMap::new(),
            next_id: AtomicU64::new(1),
            max_revisions,
        }
    }

    /// Create a task in `pending` and return a snapshot of it.
    pub fn create(
        &self,
        query: String,
        tenant_id: String,
        context: BTreeMap<String, ContextValue>,
        fingerprint: String,
        deadline: Instant,
    ) -> Task {
        let id = format!("t-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        let task = Task::new(
            id.clone(),
            query,
            tenant_id,
            context,
            fingerprint.clone(),
            deadline,
            self.max_revisions,
        );
        let snapshot = task.clone();
        self.tasks.insert(id.clone(), Arc::new(Mutex::new(task)));
        self.by_fingerprint.insert(fingerprint, id);
        snapshot
    }

    fn slot(&self, id: &str) -> Result<Arc<Mutex<Task>>, FlowError> {
        self.tasks
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| FlowError::TaskNotFound {
                task_id: id.to_string(),
            })
    }

    /// Consistent snapshot of one task. Never observes a partially-applied
    /// mutation: updates commit a fully-mutated record or nothing.
    pub async fn get(&self, id: &str) -> Result<Task, FlowError> {
        let slot = self.slot(id)?;
        let guard = slot.lock().await;
        Ok(guard.clone())
    }

    /// Apply a mutation under the task's exclusion lock.
    ///
    /// The mutator runs against a clone; only a successful result is
    /// committed, so a failed mutator leaves the record untouched. Returns
    /// the mutator's value and the committed snapshot.
    pub async fn update<R>(
        &self,
        id: &str,
        mutate: impl FnOnce(&mut Task) -> Result<R, FlowError>,
    ) -> Result<(R, Task), FlowError> {
        let slot = self.slot(id)?;
        let mut guard = slot.lock().await;

        let mut working = guard.clone();
        let value = mutate(&mut working)?;
        let snapshot = working.clone();
        *guard = working;
        drop(guard);

        if snapshot.status.is_terminal() {
            self.by_fingerprint
                .remove_if(&snapshot.fingerprint, |_, tid| tid == &snapshot.id);
        }
        Ok((value, snapshot))
    }

    /// Snapshots of every non-terminal task. Unordered.
    pub async fn list_active(&self) -> Vec<Task> {
        let slots: Vec<Arc<Mutex<Task>>> =
            self.tasks.iter().map(|e| e.value().clone()).collect();
        let mut active = Vec::new();
        for slot in slots {
            let guard = slot.lock().await;
            if !guard.status.is_terminal() {
                active.push(guard.clone());
            }
        }
        active
    }

    /// The in-flight task (if any) for a fingerprint.
    pub fn find_by_fingerprint(&self, fingerprint: &str) -> Option<String> {
        self.by_fingerprint
            .get(fingerprint)
            .map(|entry| entry.value().clone())
    }

    /// Drop terminal tasks whose last update is older than `retention`.
    /// Returns the number pruned. Non-terminal tasks are never touched.
    pub async fn prune_terminal(&self, retention: Duration) -> usize {
        let ids: Vec<String> = self.tasks.iter().map(|e| e.key().clone()).collect();
        let mut pruned = 0usize;
        for id in ids {
            let Ok(slot) = self.slot(&id) else { continue };
            let expired = {
                let guard = slot.lock().await;
                guard.status.is_terminal() && guard.updated_at.elapsed() > retention
            };
            if expired {
                self.tasks.remove(&id);
                pruned += 1;
            }
        }
        pruned
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
