//! Pool of forked copies of this binary.
//!
//! A forked worker is the current executable started with the hidden
//! `worker` subcommand. Right after launch it is told which pre-registered
//! handler to run (and with what arguments); from then on every request is
//! a `"<id>\n<json>"` message answered by `"<id>\n<json>"` or
//! `"<id>\nERR\n<text>"`. Messages travel as framed lines on stdin/stdout.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::process::{ChildStdout, Command};
use tokio::sync::RwLock;
use tracing::{debug, error, info};

use workpool_core::protocol::{HostMessage, WorkerReply, decode_frame, encode_frame};

use super::process::{self, LossyLines};
use super::state::PoolState;
use super::worker::{WorkerHandle, WorkerId};
use super::{PendingResult, PoolError, PoolKind, PoolOptions, WorkerPool};

/// Which handler a forked worker runs, and the data it is configured with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerSpec {
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

impl HandlerSpec {
    pub fn new(name: impl Into<String>, args: Value) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }
}

type SharedState = Arc<RwLock<PoolState<String>>>;

/// Pool of forked workers.
pub struct ForkedPool {
    name: String,
    handler: HandlerSpec,
    options: PoolOptions,
    state: SharedState,
}

impl ForkedPool {
    pub fn new(name: impl Into<String>, handler: HandlerSpec, options: PoolOptions) -> Self {
        Self {
            name: name.into(),
            handler,
            options,
            state: Arc::new(RwLock::new(PoolState::new())),
        }
    }

    pub const fn handler(&self) -> &HandlerSpec {
        &self.handler
    }

    fn program(&self) -> std::io::Result<PathBuf> {
        match &self.options.worker_program {
            Some(program) => Ok(program.clone()),
            None => std::env::current_exe(),
        }
    }

    fn launch_worker(
        &self,
        id: WorkerId,
        program: &Path,
        bootstrap: &str,
    ) -> std::io::Result<WorkerHandle> {
        let mut cmd = Command::new(program);
        // Worker logs go straight to our stderr.
        cmd.args(&self.options.worker_args).stderr(Stdio::inherit());
        let launched = process::launch(cmd, id)?;

        if launched.handle.send(bootstrap.to_string()).is_err() {
            return Err(std::io::Error::other("worker stdin closed before bootstrap"));
        }

        let reader = tokio::spawn(read_replies(
            self.name.clone(),
            Arc::clone(&self.state),
            id,
            launched.stdout,
        ));

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
                    error!(pool = %pool, worker = %id, ?lost, orphaned, "Forked worker lost");
                }
            },
        );

        Ok(launched.handle)
    }
}

async fn read_replies(pool: String, state: SharedState, worker: WorkerId, stdout: ChildStdout) {
    let mut lines = LossyLines::new(stdout);
    while let Some(line) = lines.next_line().await {
        let reply = match decode_frame(&line).and_then(|text| WorkerReply::decode(&text)) {
            Ok(reply) => reply,
            Err(e) => {
                debug!(pool = %pool, worker = %worker, error = %e, "Ignoring worker output");
                continue;
            }
        };

        let (task_id, outcome) = match reply {
            WorkerReply::Success { task_id, body } => (task_id, Ok(body)),
            WorkerReply::Failure { task_id, error } => (task_id, Err(PoolError::Remote(error))),
        };
        if !state.write().await.complete(&task_id, outcome) {
            debug!(pool = %pool, worker = %worker, task_id = %task_id, "Reply for unknown task");
        }
    }
    debug!(pool = %pool, worker = %worker, "reply reader finished");
}

#[async_trait]
impl WorkerPool for ForkedPool {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> PoolKind {
        PoolKind::Forked
    }

    async fn spawn(&self, count: usize) {
        let bootstrap = HostMessage::Bootstrap {
            handler: self.handler.name.clone(),
            args: self.handler.args.clone(),
        };
        let frame = match bootstrap.encode().and_then(|text| encode_frame(&text)) {
            Ok(frame) => frame,
            Err(e) => {
                error!(pool = %self.name, handler = %self.handler.name, error = %e, "Cannot encode bootstrap");
                return;
            }
        };
        let program = match self.program() {
            Ok(program) => program,
            Err(e) => {
                error!(pool = %self.name, error = %e, "Cannot resolve worker executable");
                return;
            }
        };

        for _ in 0..count {
            let mut state = self.state.write().await;
            let id = state.next_worker_id();
            match self.launch_worker(id, &program, &frame) {
                Ok(handle) => {
                    info!(
                        pool = %self.name,
                        worker = %id,
                        pid = ?handle.pid(),
                        handler = %self.handler.name,
                        "Spawned forked worker"
                    );
                    state.workers.push(handle);
                }
                Err(e) => {
                    error!(
                        pool = %self.name,
                        program = %program.display(),
                        error = %e,
                        "Failed to spawn forked worker"
                    );
                }
            }
        }
    }

    async fn submit(&self, payload: Value) -> Result<PendingResult, PoolError> {
        self.state.write().await.dispatch(
            &self.name,
            || uuid::Uuid::new_v4().to_string(),
            |task_id| {
                HostMessage::Request {
                    task_id: task_id.clone(),
                    payload,
                }
                .encode()
                .and_then(|text| encode_frame(&text))
                .map_err(|e| PoolError::Encode {
                    reason: e.to_string(),
                })
            },
        )
    }

    async fn destroy(&self) {
        let count = self.state.write().await.destroy(&self.name);
        if count > 0 {
            info!(pool = %self.name, workers = count, "Destroyed forked pool");
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
    fn handler_spec_args_default_to_null() {
        let spec: HandlerSpec = serde_json::from_str(r#"{"name": "echo"}"#).unwrap();
        assert_eq!(spec, HandlerSpec::new("echo", Value::Null));
    }

    #[tokio::test]
    async fn submit_on_empty_pool_fails_fast() {
        let pool = ForkedPool::new(
            "forked",
            HandlerSpec::new("echo", Value::Null),
            PoolOptions::default(),
        );
        let err = pool.submit(json!(1)).await.unwrap_err();
        assert!(matches!(err, PoolError::NoWorkersAvailable { .. }));
        assert_eq!(pool.pending_count().await, 0);
    }

    #[tokio::test]
    async fn bad_handler_name_spawns_nothing() {
        let pool = ForkedPool::new(
            "forked",
            HandlerSpec::new("two\nlines", Value::Null),
            PoolOptions::default(),
        );
        pool.spawn(1).await;
        assert_eq!(pool.worker_count().await, 0);
    }
}
