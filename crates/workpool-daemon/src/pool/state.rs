//! State shared by a pool and the I/O tasks of its workers.
//!
//! Every mutation of worker loads and the task registry happens through
//! [`PoolState`] while the pool's write lock is held, so dispatch, response
//! handling and eviction are serialized exactly as on a single event loop.

use std::fmt::Display;
use std::hash::Hash;

use tracing::{debug, warn};

use super::registry::{Outcome, Task, TaskRegistry};
use super::worker::{WorkerHandle, WorkerId, WorkerSet};
use super::{PendingResult, PoolError};

#[derive(Debug)]
pub(crate) struct PoolState<K> {
    pub workers: WorkerSet,
    pub tasks: TaskRegistry<K>,
    next_worker: u64,
}

impl<K: Eq + Hash + Clone + Display> PoolState<K> {
    pub fn new() -> Self {
        Self {
            workers: WorkerSet::new(),
            tasks: TaskRegistry::new(),
            next_worker: 0,
        }
    }

    pub const fn next_worker_id(&mut self) -> WorkerId {
        let id = WorkerId(self.next_worker);
        self.next_worker += 1;
        id
    }

    /// Record a new task and write its request to the least-loaded worker.
    ///
    /// `next_id` is called until it yields an id that is not pending;
    /// `encode` turns that id into the bytes for the worker's stdin. A
    /// worker whose stdin writer has stopped is evicted and the request goes
    /// to the next candidate.
    pub fn dispatch(
        &mut self,
        pool: &str,
        mut next_id: impl FnMut() -> K,
        encode: impl FnOnce(&K) -> Result<String, PoolError>,
    ) -> Result<PendingResult, PoolError> {
        if self.workers.is_empty() {
            return Err(PoolError::NoWorkersAvailable {
                pool: pool.to_string(),
            });
        }
        let mut task_id = next_id();
        while self.tasks.contains(&task_id) {
            task_id = next_id();
        }
        let mut data = encode(&task_id)?;

        let worker_id = loop {
            let Some(worker) = self.workers.least_loaded_mut() else {
                return Err(PoolError::NoWorkersAvailable {
                    pool: pool.to_string(),
                });
            };
            let worker_id = worker.id();
            match worker.send(data) {
                Ok(()) => {
                    worker.increment_load();
                    break worker_id;
                }
                Err(unsent) => {
                    data = unsent;
                    warn!(pool, worker = %worker_id, "Worker stdin is gone, evicting");
                    self.evict(pool, worker_id);
                }
            }
        };

        let (task, rx) = Task::new(worker_id);
        self.tasks.insert(task_id.clone(), task);

        debug!(pool, task_id = %task_id, worker = %worker_id, "Dispatched task");
        Ok(PendingResult::new(worker_id, task_id.to_string(), rx))
    }

    /// Settle a task. Returns `false` if no such task is pending.
    pub fn complete(&mut self, task_id: &K, outcome: Outcome) -> bool {
        let Some(task) = self.tasks.take(task_id) else {
            return false;
        };
        if let Some(worker) = self.workers.get_mut(task.worker()) {
            worker.decrement_load();
        }
        debug!(
            task_id = %task_id,
            worker = %task.worker(),
            elapsed_ms = u64::try_from(task.age().as_millis()).unwrap_or(u64::MAX),
            ok = outcome.is_ok(),
            "Task settled"
        );
        task.settle(outcome);
        true
    }

    /// Remove a worker, disconnect it and reject the tasks it was holding.
    ///
    /// Returns the number of rejected tasks, or `None` if the worker had
    /// already been removed.
    pub fn evict(&mut self, pool: &str, worker: WorkerId) -> Option<usize> {
        let handle = self.workers.remove(worker)?;
        handle.disconnect();

        let orphans = self.tasks.take_for_worker(worker);
        let count = orphans.len();
        for (_, task) in orphans {
            task.settle(Err(PoolError::WorkerLost { worker }));
        }
        if count > 0 {
            warn!(pool, worker = %worker, orphaned = count, "Rejected tasks of evicted worker");
        }
        Some(count)
    }

    /// Disconnect every worker and reject every pending task.
    pub fn destroy(&mut self, pool: &str) -> usize {
        let workers: Vec<WorkerHandle> = self.workers.drain();
        let count = workers.len();
        for worker in workers {
            worker.disconnect();
        }
        for (_, task) in self.tasks.drain() {
            task.settle(Err(PoolError::PoolDestroyed {
                pool: pool.to_string(),
            }));
        }
        count
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::pool::worker::detached_handle;
    use serde_json::json;
    use tokio::sync::mpsc;

    /// State with `n` workers whose stdin lands in the returned receivers.
    fn state_with(n: u64) -> (PoolState<u64>, Vec<mpsc::UnboundedReceiver<String>>) {
        let mut state = PoolState::new();
        let mut inputs = Vec::new();
        for _ in 0..n {
            let id = state.next_worker_id();
            let (stdin_tx, stdin_rx) = mpsc::unbounded_channel();
            let (shutdown_tx, _) = tokio::sync::oneshot::channel();
            state
                .workers
                .push(WorkerHandle::new(id, None, stdin_tx, shutdown_tx));
            inputs.push(stdin_rx);
        }
        (state, inputs)
    }

    #[tokio::test]
    async fn empty_pool_rejects_without_io() {
        let mut state: PoolState<u64> = PoolState::new();
        let err = state.dispatch("p", || 0, |_| Ok("0|null\n".to_string())).unwrap_err();
        assert!(matches!(err, PoolError::NoWorkersAvailable { .. }));
        assert!(state.tasks.is_empty());
    }

    #[tokio::test]
    async fn dispatch_writes_and_counts_load() {
        let (mut state, mut inputs) = state_with(2);
        let pending = state.dispatch("p", || 0, |id| Ok(format!("{id}|{{}}\n"))).unwrap();

        assert_eq!(pending.worker(), WorkerId(0));
        assert_eq!(inputs[0].try_recv().unwrap(), "0|{}\n");
        assert!(inputs[1].try_recv().is_err());
        assert_eq!(state.workers.loads(), vec![(WorkerId(0), 1), (WorkerId(1), 0)]);
    }

    #[tokio::test]
    async fn complete_resolves_and_releases_load() {
        let (mut state, _inputs) = state_with(1);
        let pending = state.dispatch("p", || 9, |_| Ok("9|1\n".to_string())).unwrap();

        assert!(state.complete(&9, Ok(json!(1))));
        assert!(!state.complete(&9, Ok(json!(2))));
        assert_eq!(pending.await.unwrap(), json!(1));
        assert_eq!(state.workers.loads(), vec![(WorkerId(0), 0)]);
    }

    #[tokio::test]
    async fn evict_rejects_only_that_workers_tasks() {
        let (mut state, _inputs) = state_with(2);
        let on_first = state.dispatch("p", || 0, |_| Ok(String::new())).unwrap();
        let on_second = state.dispatch("p", || 1, |_| Ok(String::new())).unwrap();

        assert_eq!(state.evict("p", WorkerId(0)), Some(1));
        assert_eq!(state.evict("p", WorkerId(0)), None);

        assert!(matches!(
            on_first.await,
            Err(PoolError::WorkerLost { worker: WorkerId(0) })
        ));
        assert_eq!(state.workers.ids(), vec![WorkerId(1)]);
        assert!(state.complete(&1, Ok(json!("ok"))));
        assert_eq!(on_second.await.unwrap(), json!("ok"));
    }

    #[tokio::test]
    async fn destroy_is_idempotent() {
        let (mut state, _inputs) = state_with(2);
        let pending = state.dispatch("p", || 0, |_| Ok(String::new())).unwrap();

        assert_eq!(state.destroy("p"), 2);
        assert_eq!(state.destroy("p"), 0);
        assert!(state.workers.is_empty());
        assert!(matches!(pending.await, Err(PoolError::PoolDestroyed { .. })));
    }

    #[tokio::test]
    async fn dead_writer_is_evicted_and_request_rerouted() {
        let mut state: PoolState<u64> = PoolState::new();
        state.workers.push(detached_handle(4));
        let (stdin_tx, mut stdin_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = tokio::sync::oneshot::channel();
        state
            .workers
            .push(WorkerHandle::new(WorkerId(5), None, stdin_tx, shutdown_tx));

        let pending = state.dispatch("p", || 0, |_| Ok("0|1\n".to_string())).unwrap();
        assert_eq!(pending.worker(), WorkerId(5));
        assert_eq!(stdin_rx.try_recv().unwrap(), "0|1\n");
        assert_eq!(state.workers.ids(), vec![WorkerId(5)]);
    }

    #[tokio::test]
    async fn only_dead_writers_means_no_workers() {
        let mut state: PoolState<u64> = PoolState::new();
        state.workers.push(detached_handle(4));
        let err = state.dispatch("p", || 0, |_| Ok(String::new())).unwrap_err();
        assert!(matches!(err, PoolError::NoWorkersAvailable { .. }));
        assert!(state.workers.is_empty());
        assert!(state.tasks.is_empty());
    }

    #[tokio::test]
    async fn pending_ids_are_skipped() {
        let (mut state, _inputs) = state_with(1);
        let _first = state.dispatch("p", || 7, |_| Ok(String::new())).unwrap();

        let mut candidates = vec![8, 7].into_iter();
        let second = state
            .dispatch("p", || candidates.next_back().unwrap(), |_| Ok(String::new()))
            .unwrap();
        assert_eq!(second.task_id(), "8");
        assert_eq!(state.tasks.len(), 2);
    }
}
