//! Compensation queue
//!
//! Holds secondary writes that must be retried after the primary committed.
//! One queue belongs to one coordinator and is shared by reference with its
//! workers; there is no process-wide instance.
//!
//! Workers claim due tasks under a lease (visibility timeout). A claimed task
//! is invisible to other workers until the lease is completed, failed or
//! expires. Completions carry the lease token, so a worker whose lease
//! expired and was re-claimed elsewhere cannot remove or reschedule the task.
//!
//! Tasks are coalesced per `(collection, id)`: a newer failed write replaces
//! the pending payload instead of queueing a second task, since only the
//! latest primary state matters to the secondary.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use duplex_core::{
    observe, CompensationPayload, CompensationTask, DuplexError, Result, TaskId,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

/// Proof of a claim, handed back on completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseToken {
    pub task_id: TaskId,
    claim: u64,
    generation: u64,
}

/// A task claimed by one worker.
#[derive(Debug, Clone)]
pub struct ClaimedTask {
    pub task: CompensationTask,
    pub lease: LeaseToken,
}

/// A task that ran out of retries.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub task: CompensationTask,
    pub dead_lettered_at: DateTime<Utc>,
    pub reason: String,
}

#[derive(Debug)]
struct Lease {
    claim: u64,
    owner: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug)]
struct Entry {
    task: CompensationTask,
    /// Bumped whenever a newer write replaces the payload.
    generation: u64,
    lease: Option<Lease>,
}

impl Entry {
    fn is_leased(&self, now: DateTime<Utc>) -> bool {
        self.lease.as_ref().is_some_and(|l| l.expires_at > now)
    }
}

#[derive(Debug, Default)]
struct QueueState {
    pending: BTreeMap<TaskId, Entry>,
    by_key: HashMap<(String, String), TaskId>,
    dead_letters: BTreeMap<TaskId, DeadLetter>,
    next_task: u64,
    next_claim: u64,
}

impl QueueState {
    fn entry_for(&mut self, lease: &LeaseToken) -> Option<&mut Entry> {
        self.pending
            .get_mut(&lease.task_id)
            .filter(|e| e.lease.as_ref().is_some_and(|l| l.claim == lease.claim))
    }

    fn remove(&mut self, id: TaskId) -> Option<Entry> {
        let entry = self.pending.remove(&id)?;
        self.by_key.remove(&(
            entry.task.collection.clone(),
            entry.task.record_id().to_string(),
        ));
        Some(entry)
    }
}

/// Outcome of enqueueing a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    /// A new task was created.
    Created(TaskId),
    /// An existing task for the same record now carries the newer payload.
    Coalesced(TaskId),
}

impl Enqueued {
    pub fn task_id(self) -> TaskId {
        match self {
            Enqueued::Created(id) | Enqueued::Coalesced(id) => id,
        }
    }
}

#[derive(Debug, Default)]
pub struct CompensationQueue {
    state: Mutex<QueueState>,
}

impl CompensationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `payload` for `collection`, first due at `next_retry_at`.
    pub fn enqueue(
        &self,
        collection: &str,
        payload: CompensationPayload,
        next_retry_at: DateTime<Utc>,
        error: Option<String>,
    ) -> Enqueued {
        let mut state = self.state.lock();
        let key = (collection.to_string(), payload.record_id().to_string());

        if let Some(id) = state.by_key.get(&key).copied() {
            if let Some(entry) = state.pending.get_mut(&id) {
                entry.task.operation = payload.op();
                entry.task.payload = payload;
                entry.task.attempts = 0;
                entry.task.next_retry_at = next_retry_at;
                entry.task.last_error = error;
                entry.generation += 1;
                tracing::debug!(task = %id, collection, "Coalesced compensation task");
                return Enqueued::Coalesced(id);
            }
        }

        state.next_task += 1;
        let id = TaskId(state.next_task);
        let task = CompensationTask {
            id,
            collection: collection.to_string(),
            operation: payload.op(),
            payload,
            attempts: 0,
            next_retry_at,
            created_at: Utc::now(),
            last_error: error,
        };
        state.by_key.insert(key, id);
        state.pending.insert(
            id,
            Entry {
                task,
                generation: 0,
                lease: None,
            },
        );
        observe::set_compensation_depth(state.pending.len());
        Enqueued::Created(id)
    }

    /// Claim up to `limit` due, unleased tasks in creation order.
    pub fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        lease: Duration,
        owner: &str,
    ) -> Vec<ClaimedTask> {
        let lease = ChronoDuration::from_std(lease).unwrap_or_else(|_| ChronoDuration::days(365));
        let expires_at = now.checked_add_signed(lease).unwrap_or(DateTime::<Utc>::MAX_UTC);

        let mut state = self.state.lock();
        let due: Vec<TaskId> = state
            .pending
            .iter()
            .filter(|(_, e)| e.task.is_due(now) && !e.is_leased(now))
            .map(|(id, _)| *id)
            .take(limit)
            .collect();

        let mut claimed = Vec::with_capacity(due.len());
        for id in due {
            state.next_claim += 1;
            let claim = state.next_claim;
            if let Some(entry) = state.pending.get_mut(&id) {
                if let Some(previous) = &entry.lease {
                    tracing::warn!(
                        task = %id,
                        previous_owner = %previous.owner,
                        "Compensation lease expired, re-claiming"
                    );
                }
                entry.lease = Some(Lease {
                    claim,
                    owner: owner.to_string(),
                    expires_at,
                });
                claimed.push(ClaimedTask {
                    task: entry.task.clone(),
                    lease: LeaseToken {
                        task_id: id,
                        claim,
                        generation: entry.generation,
                    },
                });
            }
        }
        claimed
    }

    /// Remove a task whose secondary write succeeded.
    ///
    /// Returns `false` when the lease is stale, or when a newer payload
    /// arrived while the task was in flight; that payload stays queued.
    pub fn complete(&self, lease: &LeaseToken) -> bool {
        let mut state = self.state.lock();
        let Some(entry) = state.entry_for(lease) else {
            return false;
        };
        if entry.generation != lease.generation {
            entry.lease = None;
            return false;
        }
        state.remove(lease.task_id);
        observe::set_compensation_depth(state.pending.len());
        true
    }

    /// Release a failed claim and reschedule it.
    ///
    /// Returns the task's attempt count afterwards, or `None` for a stale
    /// lease.
    pub fn fail(
        &self,
        lease: &LeaseToken,
        error: impl Into<String>,
        next_retry_at: DateTime<Utc>,
    ) -> Option<u32> {
        let mut state = self.state.lock();
        let entry = state.entry_for(lease)?;
        entry.lease = None;
        if entry.generation == lease.generation {
            entry.task.attempts += 1;
            entry.task.next_retry_at = next_retry_at;
            entry.task.last_error = Some(error.into());
        }
        Some(entry.task.attempts)
    }

    /// Move a claimed task to the dead-letter set.
    ///
    /// A task whose payload was replaced while in flight is released instead,
    /// since the newer payload has not been tried yet.
    pub fn dead_letter(&self, lease: &LeaseToken, reason: impl Into<String>) -> Option<CompensationTask> {
        let mut state = self.state.lock();
        let entry = state.entry_for(lease)?;
        if entry.generation != lease.generation {
            entry.lease = None;
            return None;
        }

        let mut entry = state.remove(lease.task_id)?;
        let reason = reason.into();
        entry.task.attempts += 1;
        entry.task.last_error = Some(reason.clone());
        let task = entry.task.clone();
        state.dead_letters.insert(
            lease.task_id,
            DeadLetter {
                task: entry.task,
                dead_lettered_at: Utc::now(),
                reason,
            },
        );
        observe::set_compensation_depth(state.pending.len());
        Some(task)
    }

    /// Settle the pending task for a record whose secondary copy was just
    /// written successfully.
    ///
    /// An unleased task is dropped. A leased task is in flight with an older
    /// payload, so it is handed `latest` instead: the worker's completion is
    /// then ignored and the newest state is replayed once more.
    pub fn discard_for(
        &self,
        collection: &str,
        id: &str,
        latest: CompensationPayload,
    ) -> Option<TaskId> {
        let now = Utc::now();
        let mut state = self.state.lock();
        let task_id = *state
            .by_key
            .get(&(collection.to_string(), id.to_string()))?;
        let entry = state.pending.get_mut(&task_id)?;
        if entry.is_leased(now) {
            entry.task.operation = latest.op();
            entry.task.payload = latest;
            entry.task.attempts = 0;
            entry.task.next_retry_at = now;
            entry.generation += 1;
            return None;
        }
        state.remove(task_id);
        observe::set_compensation_depth(state.pending.len());
        Some(task_id)
    }

    pub fn get(&self, id: TaskId) -> Option<CompensationTask> {
        self.state.lock().pending.get(&id).map(|e| e.task.clone())
    }

    /// Pending task for one record, if any.
    pub fn find(&self, collection: &str, id: &str) -> Option<CompensationTask> {
        let state = self.state.lock();
        let task_id = state
            .by_key
            .get(&(collection.to_string(), id.to_string()))?;
        state.pending.get(task_id).map(|e| e.task.clone())
    }

    /// All pending tasks in creation order.
    pub fn pending(&self) -> Vec<CompensationTask> {
        self.state
            .lock()
            .pending
            .values()
            .map(|e| e.task.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Earliest retry time among unleased tasks.
    pub fn next_due_at(&self) -> Option<DateTime<Utc>> {
        let now = Utc::now();
        self.state
            .lock()
            .pending
            .values()
            .filter(|e| !e.is_leased(now))
            .map(|e| e.task.next_retry_at)
            .min()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state.lock().dead_letters.values().cloned().collect()
    }

    pub fn dead_letter_count(&self) -> usize {
        self.state.lock().dead_letters.len()
    }

    /// Put a dead-lettered task back into the pending set with a fresh
    /// attempt budget.
    ///
    /// If a newer task for the same record is already pending, the dead
    /// letter is dropped and the pending task's id is returned.
    pub fn requeue_dead_letter(&self, id: TaskId, now: DateTime<Utc>) -> Result<TaskId> {
        let mut state = self.state.lock();
        let letter = state
            .dead_letters
            .remove(&id)
            .ok_or_else(|| DuplexError::NotFound(format!("dead letter {}", id)))?;

        let key = (
            letter.task.collection.clone(),
            letter.task.record_id().to_string(),
        );
        if let Some(existing) = state.by_key.get(&key) {
            tracing::info!(
                dead_letter = %id,
                pending = %existing,
                "Dropping dead letter superseded by a newer pending task"
            );
            return Ok(*existing);
        }

        let mut task = letter.task;
        task.attempts = 0;
        task.next_retry_at = now;
        state.by_key.insert(key, id);
        state.pending.insert(
            id,
            Entry {
                task,
                generation: 0,
                lease: None,
            },
        );
        observe::set_compensation_depth(state.pending.len());
        tracing::info!(task = %id, "Requeued dead-lettered compensation task");
        Ok(id)
    }

    /// Remove every dead letter, returning how many were dropped.
    pub fn clear_dead_letters(&self) -> usize {
        let mut state = self.state.lock();
        let n = state.dead_letters.len();
        state.dead_letters.clear();
        n
    }
}
