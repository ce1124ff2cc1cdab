use conductor_core::{ConductorError, ConductorResult, TaskError};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap, VecDeque};
use tokio::time::Instant;

use crate::state::{QueuedTask, TaskStatus};
use crate::types::{Priority, Task, TaskId, TaskResult};

/// Ordering key of the ready set: highest priority first, then submission order.
type ReadyKey = (Reverse<Priority>, u64);

/// Outcome of [`TaskQueue::cancel`].
#[derive(Debug, Clone, PartialEq)]
pub enum CancelOutcome {
    /// The task was removed; its cancelled result is returned.
    Cancelled(TaskResult),
    /// The task is processing and was only marked for cancellation.
    Requested,
    /// The task already finished.
    AlreadyFinished,
    NotFound,
}

struct Finished {
    task: Task,
    result: TaskResult,
}

/// Bounded priority queue with an index of every non-terminal task and a
/// bounded history of terminal results.
///
/// Pending tasks waiting for a retry sit in a due-time heap and are promoted
/// back to the ready set with their original sequence number, so a retried
/// task keeps its FIFO position within its priority level.
pub struct TaskQueue {
    max_size: usize,
    history_limit: usize,
    next_seq: u64,
    entries: HashMap<TaskId, QueuedTask>,
    ready: BTreeMap<ReadyKey, TaskId>,
    delayed: BinaryHeap<Reverse<(Instant, u64, TaskId)>>,
    history_order: VecDeque<TaskId>,
    history: HashMap<TaskId, Finished>,
}

impl TaskQueue {
    /// Queue holding at most `max_size` live tasks and `history_limit` results.
    pub fn new(max_size: usize, history_limit: usize) -> Self {
        Self {
            max_size,
            history_limit,
            next_seq: 0,
            entries: HashMap::new(),
            ready: BTreeMap::new(),
            delayed: BinaryHeap::new(),
            history_order: VecDeque::new(),
            history: HashMap::new(),
        }
    }

    /// Number of non-terminal tasks.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no task is live.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Maximum number of live tasks.
    pub fn capacity(&self) -> usize {
        self.max_size
    }

    /// Room left before `push` starts failing with `QueueFull`.
    pub fn remaining(&self) -> usize {
        self.max_size.saturating_sub(self.entries.len())
    }

    /// Whether `id` is queued or still in the result history. Ids evicted
    /// from the history are forgotten and may be submitted again.
    pub fn contains(&self, id: TaskId) -> bool {
        self.entries.contains_key(&id) || self.history.contains_key(&id)
    }

    /// Add a task to the ready set.
    pub fn push(&mut self, task: Task) -> ConductorResult<TaskId> {
        if self.contains(task.id) {
            return Err(ConductorError::DuplicateTask(task.id));
        }
        if self.entries.len() >= self.max_size {
            return Err(ConductorError::QueueFull {
                capacity: self.max_size,
            });
        }
        let id = task.id;
        let seq = self.next_seq;
        self.next_seq += 1;
        self.ready.insert((Reverse(task.priority), seq), id);
        self.entries.insert(id, QueuedTask::new(task, seq));
        Ok(id)
    }

    /// Ready task ids in dispatch order.
    pub fn ready_ids(&self) -> Vec<TaskId> {
        self.ready.values().copied().collect()
    }

    /// Tasks ready to be assigned now.
    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    /// Tasks in `Pending`, whether ready or waiting for a retry.
    pub fn pending_count(&self) -> usize {
        self.entries
            .values()
            .filter(|q| q.status == TaskStatus::Pending)
            .count()
    }

    /// Live entry for `id`.
    pub fn get(&self, id: TaskId) -> Option<&QueuedTask> {
        self.entries.get(&id)
    }

    /// The task itself, whether still queued or already finished.
    pub fn task(&self, id: TaskId) -> Option<&Task> {
        self.entries
            .get(&id)
            .map(|q| &q.task)
            .or_else(|| self.history.get(&id).map(|f| &f.task))
    }

    /// Status of a live task or a task still in history.
    pub fn status(&self, id: TaskId) -> Option<TaskStatus> {
        self.entries
            .get(&id)
            .map(|q| q.status)
            .or_else(|| self.history.get(&id).map(|f| f.result.status))
    }

    /// Terminal result, while still in history.
    pub fn result(&self, id: TaskId) -> Option<&TaskResult> {
        self.history.get(&id).map(|f| &f.result)
    }

    /// Move a ready task to `Assigned`. Returns the attempt number.
    pub fn assign(&mut self, id: TaskId, worker_id: &str) -> ConductorResult<u32> {
        let entry = self
            .entries
            .get_mut(&id)
            .ok_or(ConductorError::TaskNotFound(id))?;
        let attempt = entry.assign(worker_id)?;
        self.ready.remove(&(Reverse(entry.task.priority), entry.seq));
        Ok(attempt)
    }

    /// `Assigned -> Processing`. Returns `false` if the task was cancelled in
    /// between.
    pub fn begin_processing(&mut self, id: TaskId) -> bool {
        match self.entries.get_mut(&id) {
            Some(entry) if entry.status == TaskStatus::Assigned => {
                entry.transition(TaskStatus::Processing).is_ok()
            }
            _ => false,
        }
    }

    /// Record a terminal outcome and move the task to history.
    pub fn finish(&mut self, id: TaskId, result: TaskResult) -> ConductorResult<()> {
        let entry = self
            .entries
            .get_mut(&id)
            .ok_or(ConductorError::TaskNotFound(id))?;
        entry.transition(result.status)?;
        entry.last_error.clone_from(&result.error);
        if let Some(entry) = self.entries.remove(&id) {
            self.record_history(entry.task, result);
        }
        Ok(())
    }

    /// Return a failed attempt to `Pending`, due again at `due`.
    pub fn schedule_retry(
        &mut self,
        id: TaskId,
        error: TaskError,
        due: Instant,
    ) -> ConductorResult<()> {
        let entry = self
            .entries
            .get_mut(&id)
            .ok_or(ConductorError::TaskNotFound(id))?;
        let failed = if error.is_timeout() {
            TaskStatus::Timeout
        } else {
            TaskStatus::Failed
        };
        entry.transition(failed)?;
        entry.transition(TaskStatus::Pending)?;
        entry.last_error = Some(error);
        self.delayed.push(Reverse((due, entry.seq, id)));
        Ok(())
    }

    /// Move every retry due at or before `now` into the ready set.
    pub fn promote_due(&mut self, now: Instant) -> usize {
        let mut promoted = 0;
        while let Some(Reverse((due, _, _))) = self.delayed.peek() {
            if *due > now {
                break;
            }
            let Some(Reverse((_, seq, id))) = self.delayed.pop() else {
                break;
            };
            // Cancelled while waiting: nothing to promote.
            if let Some(entry) = self.entries.get(&id) {
                if entry.status == TaskStatus::Pending && entry.seq == seq {
                    self.ready.insert((Reverse(entry.task.priority), seq), id);
                    promoted += 1;
                }
            }
        }
        promoted
    }

    /// Earliest pending retry due time.
    pub fn next_due(&self) -> Option<Instant> {
        self.delayed.peek().map(|Reverse((due, _, _))| *due)
    }

    /// Cancel a pending or assigned task; mark a processing one.
    ///
    /// A finished task reports `AlreadyFinished` only while its result is in
    /// the history; after eviction it is `NotFound`.
    pub fn cancel(&mut self, id: TaskId) -> CancelOutcome {
        let Some(entry) = self.entries.get_mut(&id) else {
            return if self.history.contains_key(&id) {
                CancelOutcome::AlreadyFinished
            } else {
                CancelOutcome::NotFound
            };
        };
        match entry.status {
            TaskStatus::Pending | TaskStatus::Assigned => {
                if entry.transition(TaskStatus::Cancelled).is_err() {
                    return CancelOutcome::AlreadyFinished;
                }
                let key = (Reverse(entry.task.priority), entry.seq);
                let result = TaskResult::cancelled(id, entry.attempts);
                self.ready.remove(&key);
                if let Some(entry) = self.entries.remove(&id) {
                    self.record_history(entry.task, result.clone());
                }
                CancelOutcome::Cancelled(result)
            }
            TaskStatus::Processing => {
                entry.cancel_requested = true;
                CancelOutcome::Requested
            }
            _ => CancelOutcome::AlreadyFinished,
        }
    }

    /// Non-terminal tasks in submission order.
    pub fn snapshot(&self) -> Vec<QueuedTask> {
        let mut tasks: Vec<QueuedTask> = self.entries.values().cloned().collect();
        tasks.sort_by_key(|q| q.seq);
        tasks
    }

    fn record_history(&mut self, task: Task, result: TaskResult) {
        let id = task.id;
        self.history.insert(id, Finished { task, result });
        self.history_order.push_back(id);
        while self.history_order.len() > self.history_limit {
            if let Some(oldest) = self.history_order.pop_front() {
                self.history.remove(&oldest);
            }
        }
    }
}
