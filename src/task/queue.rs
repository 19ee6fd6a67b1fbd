// Dependency-gated priority task queue

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;

use super::{Task, TaskPriority, TaskStatus};
use crate::output::ArmadaError;

/// Heap entry: higher priority pops first, FIFO among equals
#[derive(Debug, PartialEq, Eq)]
struct ReadyEntry {
    priority: TaskPriority,
    seq: u64,
    id: String,
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct QueueInner {
    /// Every task pushed and not yet removed
    tasks: HashMap<String, Arc<Mutex<Task>>>,
    heap: BinaryHeap<ReadyEntry>,
    /// Ids currently sitting in the heap; heap entries not in this set are
    /// stale and skipped on pop
    ready: HashSet<String>,
    /// Ids ever admitted to the heap; a task enters the heap at most once
    admitted: HashSet<String>,
    /// Back-index: dependency id -> ids that depend on it
    dependents: HashMap<String, Vec<String>>,
    next_seq: u64,
}

/// Priority queue with cross-task dependencies.
///
/// A task is visible to `pop` only once all of its dependencies are
/// `success`; `push` refuses duplicate ids and forward references, which
/// also rules out dependency cycles. One queue-wide lock guards every
/// operation; its scope never spans module execution.
#[derive(Default)]
pub struct TaskQueue {
    inner: Mutex<QueueInner>,
}

impl TaskQueue {
    pub fn new() -> Self {
        TaskQueue::default()
    }

    pub fn push(&self, task: Task) -> Result<(), ArmadaError> {
        let mut inner = self.inner.lock();

        if inner.tasks.contains_key(&task.id) {
            return Err(ArmadaError::Queue {
                message: format!("task id {} already exists", task.id),
            });
        }

        // Dependencies must already be present; this precludes cycles
        for dep in &task.depends_on {
            if !inner.tasks.contains_key(dep) {
                return Err(ArmadaError::Queue {
                    message: format!("unknown dependency {} for task {}", dep, task.id),
                });
            }
        }

        let satisfied = task
            .depends_on
            .iter()
            .all(|dep| dep_succeeded(&inner.tasks, dep));

        let id = task.id.clone();
        let priority = task.priority;
        for dep in &task.depends_on {
            inner
                .dependents
                .entry(dep.clone())
                .or_default()
                .push(id.clone());
        }
        inner.tasks.insert(id.clone(), Arc::new(Mutex::new(task)));

        if satisfied {
            mark_ready(&mut inner, id, priority);
        }

        Ok(())
    }

    /// Take the highest-priority ready task, if any. Does not block; the
    /// caller polls.
    pub fn pop(&self) -> Option<Arc<Mutex<Task>>> {
        let mut inner = self.inner.lock();

        while let Some(entry) = inner.heap.pop() {
            if inner.ready.remove(&entry.id) {
                if let Some(task) = inner.tasks.get(&entry.id) {
                    return Some(task.clone());
                }
            }
        }
        None
    }

    pub fn get(&self, id: &str) -> Option<Arc<Mutex<Task>>> {
        self.inner.lock().tasks.get(id).cloned()
    }

    pub fn list(&self) -> Vec<Arc<Mutex<Task>>> {
        self.inner.lock().tasks.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().tasks.is_empty()
    }

    /// Number of tasks currently visible to `pop`
    pub fn ready_len(&self) -> usize {
        self.inner.lock().ready.len()
    }

    /// Transition a task's status. Terminal states are sinks; moving to
    /// `success` re-evaluates dependent tasks for readiness.
    pub fn update_status(&self, id: &str, status: TaskStatus) -> Result<(), ArmadaError> {
        let mut inner = self.inner.lock();

        let task = inner.tasks.get(id).cloned().ok_or_else(|| ArmadaError::Queue {
            message: format!("task id {} does not exist", id),
        })?;

        {
            let mut task = task.lock();
            if task.status.is_terminal() {
                return Err(ArmadaError::Queue {
                    message: format!(
                        "task {} is already {} and cannot transition to {}",
                        id, task.status, status
                    ),
                });
            }
            task.status = status;
        }

        if status == TaskStatus::Success {
            promote_dependents(&mut inner, id);
        }

        Ok(())
    }

    /// Drop a task entirely. A removed `success` task still unblocks its
    /// dependents, exactly as a status update would.
    pub fn remove(&self, id: &str) -> Result<(), ArmadaError> {
        let mut inner = self.inner.lock();

        let task = inner.tasks.remove(id).ok_or_else(|| ArmadaError::Queue {
            message: format!("task id {} does not exist", id),
        })?;
        inner.ready.remove(id);
        inner.admitted.remove(id);

        if task.lock().status == TaskStatus::Success {
            promote_dependents(&mut inner, id);
        }
        inner.dependents.remove(id);

        Ok(())
    }

    /// Whether every task in the queue has reached a terminal state
    pub fn all_terminal(&self) -> bool {
        let inner = self.inner.lock();
        inner
            .tasks
            .values()
            .all(|t| t.lock().status.is_terminal())
    }

    /// Ids of tasks still pending (never started); used at drain time to
    /// cancel tasks stranded behind failed dependencies
    pub fn pending_ids(&self) -> Vec<String> {
        let inner = self.inner.lock();
        inner
            .tasks
            .iter()
            .filter(|(_, t)| t.lock().status == TaskStatus::Pending)
            .map(|(id, _)| id.clone())
            .collect()
    }
}

fn dep_succeeded(tasks: &HashMap<String, Arc<Mutex<Task>>>, id: &str) -> bool {
    tasks
        .get(id)
        .map(|t| t.lock().status == TaskStatus::Success)
        .unwrap_or(false)
}

fn mark_ready(inner: &mut QueueInner, id: String, priority: TaskPriority) {
    if !inner.admitted.insert(id.clone()) {
        return;
    }
    inner.ready.insert(id.clone());
    let seq = inner.next_seq;
    inner.next_seq += 1;
    inner.heap.push(ReadyEntry { priority, seq, id });
}

/// Re-evaluate everything that depends on `id` and admit newly satisfied
/// tasks to the heap (at most once each).
fn promote_dependents(inner: &mut QueueInner, id: &str) {
    let Some(dependents) = inner.dependents.get(id).cloned() else {
        return;
    };

    for dep_id in dependents {
        let Some(task) = inner.tasks.get(&dep_id) else {
            continue;
        };

        let (status, priority, deps) = {
            let task = task.lock();
            (task.status, task.priority, task.depends_on.clone())
        };

        if status != TaskStatus::Pending || inner.admitted.contains(&dep_id) {
            continue;
        }

        if deps.iter().all(|d| dep_succeeded(&inner.tasks, d)) {
            mark_ready(inner, dep_id, priority);
        }
    }
}
