//! Pool of external executables speaking the line protocol.
//!
//! Each request is written as `"<id>|<json>\n"` to a worker's stdin; the
//! worker answers `"<id>|<json>"` on stdout in any order it likes. A line
//! `"error|<diagnostic>"` means the worker is finished: it is evicted and
//! disconnected. Anything else on stdout is ignored, and stderr is only
//! logged.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use tokio::process::{ChildStderr, ChildStdout, Command};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use workpool_core::protocol::{StreamLine, encode_request, parse_line};

use super::process::{self, LossyLines};
use super::state::PoolState;
use super::worker::{WorkerHandle, WorkerId};
use super::{PendingResult, PoolError, PoolKind, PoolOptions, WorkerPool};

/// Executable and arguments a stream worker is launched with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Split an argv-style vector into program and arguments.
    pub fn from_argv(argv: &[String]) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self::new(program, args.to_vec()))
    }
}

type SharedState = Arc<RwLock<PoolState<u64>>>;

/// Pool of stream workers.
pub struct StreamPool {
    name: String,
    command: WorkerCommand,
    options: PoolOptions,
    state: SharedState,
    next_task_id: AtomicU64,
}

impl StreamPool {
    pub fn new(name: impl Into<String>, command: WorkerCommand, options: PoolOptions) -> Self {
        Self {
            name: name.into(),
            command,
            options,
            state: Arc::new(RwLock::new(PoolState::new())),
            next_task_id: AtomicU64::new(0),
        }
    }

    pub const fn command(&self) -> &WorkerCommand {
        &self.command
    }

    /// Start one worker and wire its stdout, stderr and exit handling.
    fn launch_worker(&self, id: WorkerId) -> std::io::Result<WorkerHandle> {
        let mut cmd = Command::new(&self.command.program);
        cmd.args(&self.command.args).stderr(Stdio::piped());
        let launched = process::launch(cmd, id)?;

        let reader = tokio::spawn(read_stdout(
            self.name.clone(),
            Arc::clone(&self.state),
            id,
            launched.stdout,
        ));
        if let Some(stderr) = launched.stderr {
            tokio::spawn(read_stderr(
                self.name.clone(),
                id,
                stderr,
                self.options.stderr_filter.clone(),
            ));
        }

        let pool = self.name.clone();
        let state = Arc::clone(&self.state);
        process::watch_exit(
            launched.child,
            launched.shutdown_rx,
            launched.broken_rx,
            reader,
            id,
            self.options.terminate_timeout,
            move |lost| async move {
                if let Some(orphaned) = state.write().await.evict(&pool, id) {
                    warn!(pool = %pool, worker = %id, ?lost, orphaned, "Stream worker lost");
                }
            },
        );

        Ok(launched.handle)
    }
}

async fn read_stdout(pool: String, state: SharedState, worker: WorkerId, stdout: ChildStdout) {
    let mut lines = LossyLines::new(stdout);
    while let Some(line) = lines.next_line().await {
        handle_line(&pool, &state, worker, &line).await;
    }
    debug!(pool = %pool, worker = %worker, "stdout reader finished");
}

async fn handle_line(pool: &str, state: &SharedState, worker: WorkerId, line: &str) {
    match parse_line(line) {
        StreamLine::Response { task_id, body } => {
            if !state.write().await.complete(&task_id, Ok(body)) {
                debug!(pool, worker = %worker, task_id, "Response for unknown task");
            }
        }
        StreamLine::BadResponse { task_id, reason } => {
            warn!(pool, worker = %worker, task_id, %reason, "Unreadable response body");
            state
                .write()
                .await
                .complete(&task_id, Err(PoolError::Protocol { reason }));
        }
        StreamLine::Fatal { diagnostic } => {
            error!(pool, worker = %worker, %diagnostic, "Stream worker reported a fatal failure");
            state.write().await.evict(pool, worker);
        }
        StreamLine::Unrecognized { reason } => {
            debug!(pool, worker = %worker, %reason, line, "Ignoring worker output");
        }
    }
}

async fn read_stderr(pool: String, worker: WorkerId, stderr: ChildStderr, filter: Option<Regex>) {
    // Drained until EOF so the worker never writes into a closed pipe.
    let mut lines = LossyLines::new(stderr);
    while let Some(line) = lines.next_line().await {
        if filter.as_ref().is_some_and(|re| re.is_match(&line)) {
            continue;
        }
        warn!(pool = %pool, worker = %worker, "stderr: {}", line);
    }
}

#[async_trait]
impl WorkerPool for StreamPool {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> PoolKind {
        PoolKind::Stream
    }

    async fn spawn(&self, count: usize) {
        for _ in 0..count {
            let mut state = self.state.write().await;
            let id = state.next_worker_id();
            match self.launch_worker(id) {
                Ok(handle) => {
                    info!(
                        pool = %self.name,
                        worker = %id,
                        pid = ?handle.pid(),
                        program = %self.command.program.display(),
                        "Spawned stream worker"
                    );
                    state.workers.push(handle);
                }
                Err(e) => {
                    error!(
                        pool = %self.name,
                        program = %self.command.program.display(),
                        error = %e,
                        "Failed to spawn stream worker"
                    );
                }
            }
        }
    }

    async fn submit(&self, payload: Value) -> Result<PendingResult, PoolError> {
        self.state.write().await.dispatch(
            &self.name,
            || self.next_task_id.fetch_add(1, Ordering::Relaxed),
            |task_id| {
                encode_request(*task_id, &payload).map_err(|e| PoolError::Encode {
                    reason: e.to_string(),
                })
            },
        )
    }

    async fn destroy(&self) {
        let count = self.state.write().await.destroy(&self.name);
        if count > 0 {
            info!(pool = %self.name, workers = count, "Destroyed stream pool");
        }
    }

    async fn worker_count(&self) -> usize {
        self.state.read().await.workers.len()
    }

    async fn worker_ids(&self) -> Vec<WorkerId> {
        self.state.read().await.workers.ids()
    }

    async fn loads(&self) -> Vec<(WorkerId, usize)> {
        self.state.read().await.workers.loads()
    }

    async fn pending_count(&self) -> usize {
        self.state.read().await.tasks.len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn argv_splits_program_from_args() {
        let argv = vec!["python3".to_string(), "-u".to_string(), "model.py".to_string()];
        let cmd = WorkerCommand::from_argv(&argv).unwrap();
        assert_eq!(cmd.program, PathBuf::from("python3"));
        assert_eq!(cmd.args, vec!["-u", "model.py"]);
        assert!(WorkerCommand::from_argv(&[]).is_none());
    }

    #[tokio::test]
    async fn query_on_empty_pool_fails_fast() {
        let pool = StreamPool::new(
            "empty",
            WorkerCommand::new("cat", Vec::new()),
            PoolOptions::default(),
        );
        let err = pool.query(json!({"x": 1})).await.unwrap_err();
        assert_eq!(
            err,
            PoolError::NoWorkersAvailable {
                pool: "empty".to_string()
            }
        );
        assert_eq!(pool.pending_count().await, 0);
    }

    #[tokio::test]
    async fn missing_executable_leaves_pool_empty() {
        let pool = StreamPool::new(
            "ghost",
            WorkerCommand::new("/nonexistent/workpool-test-binary", Vec::new()),
            PoolOptions::default(),
        );
        pool.spawn(2).await;
        assert_eq!(pool.worker_count().await, 0);
    }
}
