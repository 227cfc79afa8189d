//! Worker handles and least-loaded selection.

use std::fmt;

use tokio::sync::{mpsc, oneshot};

/// Identifier of a worker, unique within its pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(pub u64);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "w{}", self.0)
    }
}

/// One live worker process as seen by its pool.
///
/// Dropping or disconnecting the handle closes the worker's stdin and tells
/// its exit watcher to reap the process.
#[derive(Debug)]
pub struct WorkerHandle {
    id: WorkerId,
    pid: Option<u32>,
    /// Tasks dispatched to this worker and not yet settled.
    load: usize,
    stdin_tx: mpsc::UnboundedSender<String>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl WorkerHandle {
    pub(crate) const fn new(
        id: WorkerId,
        pid: Option<u32>,
        stdin_tx: mpsc::UnboundedSender<String>,
        shutdown_tx: oneshot::Sender<()>,
    ) -> Self {
        Self {
            id,
            pid,
            load: 0,
            stdin_tx,
            shutdown_tx: Some(shutdown_tx),
        }
    }

    pub const fn id(&self) -> WorkerId {
        self.id
    }

    pub const fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub const fn load(&self) -> usize {
        self.load
    }

    pub(crate) const fn increment_load(&mut self) {
        self.load += 1;
    }

    pub(crate) const fn decrement_load(&mut self) {
        self.load = self.load.saturating_sub(1);
    }

    /// Queue raw bytes for the worker's stdin. Hands `data` back once the
    /// stdin writer has stopped.
    pub(crate) fn send(&self, data: String) -> Result<(), String> {
        self.stdin_tx.send(data).map_err(|e| e.0)
    }

    /// Close stdin and ask the exit watcher to terminate the process.
    pub(crate) fn disconnect(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Ordered set of live workers. Iteration order is spawn order.
#[derive(Debug, Default)]
pub struct WorkerSet {
    workers: Vec<WorkerHandle>,
}

impl WorkerSet {
    pub const fn new() -> Self {
        Self {
            workers: Vec::new(),
        }
    }

    pub fn push(&mut self, worker: WorkerHandle) {
        self.workers.push(worker);
    }

    /// Worker with the smallest load; ties go to the earliest spawned.
    pub fn least_loaded_mut(&mut self) -> Option<&mut WorkerHandle> {
        self.workers.iter_mut().min_by_key(|w| w.load)
    }

    pub fn get_mut(&mut self, id: WorkerId) -> Option<&mut WorkerHandle> {
        self.workers.iter_mut().find(|w| w.id == id)
    }

    pub fn remove(&mut self, id: WorkerId) -> Option<WorkerHandle> {
        let idx = self.workers.iter().position(|w| w.id == id)?;
        Some(self.workers.remove(idx))
    }

    pub fn drain(&mut self) -> Vec<WorkerHandle> {
        std::mem::take(&mut self.workers)
    }

    pub fn ids(&self) -> Vec<WorkerId> {
        self.workers.iter().map(|w| w.id).collect()
    }

    pub fn loads(&self) -> Vec<(WorkerId, usize)> {
        self.workers.iter().map(|w| (w.id, w.load)).collect()
    }

    pub const fn len(&self) -> usize {
        self.workers.len()
    }

    pub const fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

#[cfg(test)]
pub(crate) fn detached_handle(id: u64) -> WorkerHandle {
    let (stdin_tx, _) = mpsc::unbounded_channel();
    let (shutdown_tx, _) = oneshot::channel();
    WorkerHandle::new(WorkerId(id), None, stdin_tx, shutdown_tx)
}
