//! Pending task bookkeeping.
//!
//! Maps a task id to the channel that settles the caller's
//! [`PendingResult`](super::PendingResult), and remembers which worker the
//! task was routed to so crashes can be attributed.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::oneshot;

use super::PoolError;
use super::worker::WorkerId;

pub(crate) type Outcome = Result<Value, PoolError>;

/// One outstanding request.
#[derive(Debug)]
pub struct Task {
    worker: WorkerId,
    created_at: Instant,
    responder: oneshot::Sender<Outcome>,
}

impl Task {
    pub(crate) fn new(worker: WorkerId) -> (Self, oneshot::Receiver<Outcome>) {
        let (responder, rx) = oneshot::channel();
        (
            Self {
                worker,
                created_at: Instant::now(),
                responder,
            },
            rx,
        )
    }

    pub const fn worker(&self) -> WorkerId {
        self.worker
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Deliver the outcome. A caller that stopped waiting is not an error.
    pub(crate) fn settle(self, outcome: Outcome) {
        let _ = self.responder.send(outcome);
    }
}

/// Task id -> pending task.
#[derive(Debug)]
pub struct TaskRegistry<K> {
    tasks: HashMap<K, Task>,
}

impl<K> Default for TaskRegistry<K> {
    fn default() -> Self {
        Self {
            tasks: HashMap::new(),
        }
    }
}

impl<K: Eq + Hash + Clone> TaskRegistry<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a task. Callers draw ids that are not pending (see
    /// [`contains`](Self::contains)).
    pub fn insert(&mut self, id: K, task: Task) {
        let previous = self.tasks.insert(id, task);
        debug_assert!(previous.is_none(), "task id reused while pending");
    }

    pub fn contains(&self, id: &K) -> bool {
        self.tasks.contains_key(id)
    }

    pub fn take(&mut self, id: &K) -> Option<Task> {
        self.tasks.remove(id)
    }

    /// Remove every task routed to `worker`.
    pub fn take_for_worker(&mut self, worker: WorkerId) -> Vec<(K, Task)> {
        let ids: Vec<K> = self
            .tasks
            .iter()
            .filter(|(_, t)| t.worker == worker)
            .map(|(id, _)| id.clone())
            .collect();
        ids.into_iter()
            .filter_map(|id| self.tasks.remove(&id).map(|t| (id, t)))
            .collect()
    }

    pub fn drain(&mut self) -> Vec<(K, Task)> {
        self.tasks.drain().collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
