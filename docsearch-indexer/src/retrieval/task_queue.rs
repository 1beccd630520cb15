//! Priority queue of indexing work with per-path de-duplication.
//!
//! A path is represented at most once among the pending tasks (the latest task
//! wins) and is never handed out twice at the same time: a task arriving while
//! its path is in flight is deferred until [`TaskQueue::complete`] is called.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Instant;
use tokio::sync::{Notify, watch};
use tracing::{debug, warn};

/// Priority levels for indexing tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum TaskPriority {
    /// Error retries and outdated re-indexing
    Background = 0,
    /// Files found by a folder scan
    #[default]
    Normal = 1,
    /// Watcher events, deletions and explicit requests
    High = 2,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskType {
    IndexFile { path: PathBuf },
    /// Remove a file from the index (when deleted)
    RemoveFile { path: PathBuf },
}

#[derive(Debug, Clone)]
pub struct IndexingTask {
    pub task_type: TaskType,
    pub priority: TaskPriority,
    pub created_at: Instant,
}

impl IndexingTask {
    pub fn new(task_type: TaskType, priority: TaskPriority) -> Self {
        Self {
            task_type,
            priority,
            created_at: Instant::now(),
        }
    }

    pub fn index_file(path: PathBuf, priority: TaskPriority) -> Self {
        Self::new(TaskType::IndexFile { path }, priority)
    }

    pub fn remove_file(path: PathBuf) -> Self {
        Self::new(TaskType::RemoveFile { path }, TaskPriority::High)
    }

    pub fn path(&self) -> &Path {
        match &self.task_type {
            TaskType::IndexFile { path } | TaskType::RemoveFile { path } => path,
        }
    }

    /// Get a description of the task for logging
    pub fn description(&self) -> String {
        match &self.task_type {
            TaskType::IndexFile { path } => format!("Index file: {}", path.display()),
            TaskType::RemoveFile { path } => format!("Remove file: {}", path.display()),
        }
    }
}

/// Heap entry. Higher priority first, then first come first served.
#[derive(Debug)]
struct QueuedTask {
    task: IndexingTask,
    seq: u64,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> Ordering {
        self.task
            .priority
            .cmp(&other.task.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct QueueState {
    heap: BinaryHeap<QueuedTask>,
    /// Live sequence number per pending path; older heap entries are stale.
    pending: HashMap<PathBuf, u64>,
    in_flight: HashSet<PathBuf>,
    deferred: HashMap<PathBuf, IndexingTask>,
    next_seq: u64,
}

impl QueueState {
    fn outstanding(&self) -> usize {
        self.pending.len() + self.in_flight.len() + self.deferred.len()
    }

    fn enqueue(&mut self, task: IndexingTask) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.pending.insert(task.path().to_path_buf(), seq);
        self.heap.push(QueuedTask { task, seq });
    }
}

/// Counts of work in the queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueDepth {
    /// Waiting to be handed out, including deferred re-runs.
    pub queued: usize,
    pub in_flight: usize,
}

pub struct TaskQueue {
    max_queue_size: usize,
    state: Mutex<QueueState>,
    work_available: Notify,
    outstanding: watch::Sender<usize>,
}

impl TaskQueue {
    pub fn new(max_queue_size: usize) -> Self {
        Self {
            max_queue_size,
            state: Mutex::new(QueueState::default()),
            work_available: Notify::new(),
            outstanding: watch::channel(0).0,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        // A panic while holding the lock cannot leave the state half-updated.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, state: &QueueState) {
        self.outstanding.send_replace(state.outstanding());
    }

    /// Add a task. Returns `false` when the queue is full.
    pub fn push(&self, task: IndexingTask) -> bool {
        let mut state = self.lock();
        let path = task.path().to_path_buf();

        if state.in_flight.contains(&path) {
            debug!("Deferring until current run finishes: {}", task.description());
            state.deferred.insert(path, task);
            self.publish(&state);
            return true;
        }

        if !state.pending.contains_key(&path) && state.pending.len() >= self.max_queue_size {
            warn!("Task queue is full, dropping task: {}", task.description());
            return false;
        }

        debug!("Queued task: {}", task.description());
        state.enqueue(task);
        self.publish(&state);
        drop(state);
        self.work_available.notify_one();
        true
    }

    /// Take the highest priority task and mark its path in flight.
    pub fn pop(&self) -> Option<IndexingTask> {
        let mut state = self.lock();
        while let Some(QueuedTask { task, seq }) = state.heap.pop() {
            let path = task.path().to_path_buf();
            if state.pending.get(&path) != Some(&seq) {
                continue;
            }
            state.pending.remove(&path);
            state.in_flight.insert(path);
            self.publish(&state);
            return Some(task);
        }
        None
    }

    /// Release an in-flight path, re-queueing a task that arrived meanwhile.
    pub fn complete(&self, path: &Path) {
        let mut state = self.lock();
        state.in_flight.remove(path);
        let requeued = match state.deferred.remove(path) {
            Some(task) => {
                state.enqueue(task);
                true
            }
            None => false,
        };
        self.publish(&state);
        drop(state);
        if requeued {
            self.work_available.notify_one();
        }
    }

    /// Resolves when a task may be available.
    pub async fn notified(&self) {
        self.work_available.notified().await
    }

    pub fn depth(&self) -> QueueDepth {
        let state = self.lock();
        QueueDepth {
            queued: state.pending.len() + state.deferred.len(),
            in_flight: state.in_flight.len(),
        }
    }

    pub fn is_idle(&self) -> bool {
        self.lock().outstanding() == 0
    }

    /// Resolves once nothing is queued or in flight.
    pub async fn wait_until_idle(&self) {
        let mut outstanding = self.outstanding.subscribe();
        // The sender lives as long as the queue, so this cannot fail.
        let _ = outstanding.wait_for(|n| *n == 0).await;
    }

    /// Drop every queued and deferred task. In-flight tasks run to completion.
    pub fn clear(&self) {
        let mut state = self.lock();
        state.heap.clear();
        state.pending.clear();
        state.deferred.clear();
        self.publish(&state);
        debug!("Task queue cleared");
    }
}
