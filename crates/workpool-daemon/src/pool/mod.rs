//! Worker pools: long-lived worker processes shared by many concurrent
//! requests.
//!
//! - [`WorkerPool`]: the contract every pool variant implements.
//! - [`StreamPool`]: external executables speaking the `"<id>|<json>"` line
//!   protocol on stdin/stdout.
//! - [`ForkedPool`]: re-executions of this binary running a pre-registered
//!   handler, talking framed messages on stdin/stdout.
//!
//! Both variants route each request to the least-loaded worker (ties go to
//! the earliest spawned) and evict workers that crash or exit. Tasks held by
//! an evicted worker are rejected with [`PoolError::WorkerLost`].

pub mod forked;
pub(crate) mod process;
pub mod registry;
pub(crate) mod state;
pub mod stream;
pub mod worker;

use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use tokio::sync::oneshot;

use workpool_core::config::PoolDefaults;

pub use forked::{ForkedPool, HandlerSpec};
pub use registry::{Task, TaskRegistry};
pub use stream::{StreamPool, WorkerCommand};
pub use worker::{WorkerHandle, WorkerId, WorkerSet};

/// Subcommand a forked worker is launched with.
pub const WORKER_SUBCOMMAND: &str = "worker";

/// The two pool variants, by their symbolic names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolKind {
    /// `"Spawn"`: arbitrary executables, line protocol.
    Stream,
    /// `"Query"`: forked copies of this binary, message protocol.
    Forked,
}

impl PoolKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stream => "Spawn",
            Self::Forked => "Query",
        }
    }

    /// Parse a symbolic kind name (case-insensitive).
    pub fn parse(kind: &str) -> Option<Self> {
        if kind.eq_ignore_ascii_case("spawn") {
            Some(Self::Stream)
        } else if kind.eq_ignore_ascii_case("query") {
            Some(Self::Forked)
        } else {
            None
        }
    }
}

impl fmt::Display for PoolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors delivered to callers of a pool.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("No process found: pool {pool} has no live workers")]
    NoWorkersAvailable { pool: String },

    #[error("Worker {worker} was lost before answering")]
    WorkerLost { worker: WorkerId },

    /// The worker's own error text, verbatim.
    #[error("{0}")]
    Remote(String),

    #[error("Worker sent an unreadable response: {reason}")]
    Protocol { reason: String },

    #[error("Pool {pool} was destroyed")]
    PoolDestroyed { pool: String },

    #[error("Failed to encode request: {reason}")]
    Encode { reason: String },

    #[error("Invalid worker arguments for {kind} pool: {reason}")]
    InvalidWorkerArgs { kind: PoolKind, reason: String },
}

/// Handle to one dispatched request. Settles exactly once.
#[derive(Debug)]
pub struct PendingResult {
    worker: WorkerId,
    task_id: String,
    rx: oneshot::Receiver<Result<Value, PoolError>>,
}

impl PendingResult {
    pub(crate) const fn new(
        worker: WorkerId,
        task_id: String,
        rx: oneshot::Receiver<Result<Value, PoolError>>,
    ) -> Self {
        Self {
            worker,
            task_id,
            rx,
        }
    }

    /// Worker the request was routed to.
    pub const fn worker(&self) -> WorkerId {
        self.worker
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }
}

impl Future for PendingResult {
    type Output = Result<Value, PoolError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let worker = this.worker;
        Pin::new(&mut this.rx)
            .poll(cx)
            .map(|res| res.unwrap_or(Err(PoolError::WorkerLost { worker })))
    }
}

/// Knobs shared by every pool a manager creates.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Workers spawned when the caller does not pass a count.
    pub default_workers: usize,
    /// Grace period between closing a worker's stdin and killing it.
    pub terminate_timeout: Duration,
    /// Stream-worker stderr lines matching this are dropped instead of logged.
    pub stderr_filter: Option<Regex>,
    /// Program forked workers run; `None` means the current executable.
    pub worker_program: Option<PathBuf>,
    /// Arguments passed to forked workers.
    pub worker_args: Vec<String>,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            default_workers: 1,
            terminate_timeout: Duration::from_secs(5),
            stderr_filter: Regex::new(workpool_core::config::DEFAULT_STDERR_SUPPRESS_PATTERN).ok(),
            worker_program: None,
            worker_args: vec![WORKER_SUBCOMMAND.to_string()],
        }
    }
}

impl PoolOptions {
    pub fn from_config(defaults: &PoolDefaults) -> workpool_core::Result<Self> {
        let stderr_filter = if defaults.stderr_suppress_pattern.is_empty() {
            None
        } else {
            Some(Regex::new(&defaults.stderr_suppress_pattern).map_err(|e| {
                workpool_core::Error::Config(format!("Invalid stderr suppress pattern: {e}"))
            })?)
        };
        Ok(Self {
            default_workers: defaults.default_workers.max(1),
            terminate_timeout: Duration::from_secs(defaults.terminate_timeout_secs),
            stderr_filter,
            worker_program: defaults.worker_program.clone(),
            worker_args: vec![WORKER_SUBCOMMAND.to_string()],
        })
    }
}

/// A named set of worker processes with one task registry.
///
/// `spawn` and `destroy` never fail: launch problems and crashes are logged
/// and show up as a smaller worker set.
#[async_trait]
pub trait WorkerPool: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> PoolKind;

    /// Launch `count` more workers.
    async fn spawn(&self, count: usize);

    /// Dispatch one request to the least-loaded worker.
    ///
    /// Fails immediately with [`PoolError::NoWorkersAvailable`] when the pool
    /// is empty; nothing is queued and nothing is spawned.
    async fn submit(&self, payload: Value) -> Result<PendingResult, PoolError>;

    /// Dispatch one request and wait for its result.
    async fn query(&self, payload: Value) -> Result<Value, PoolError> {
        self.submit(payload).await?.await
    }

    /// Disconnect every worker and reject pending tasks. Idempotent.
    async fn destroy(&self);

    async fn worker_count(&self) -> usize;

    async fn worker_ids(&self) -> Vec<WorkerId>;

    /// Current `(worker, load)` pairs in routing order.
    async fn loads(&self) -> Vec<(WorkerId, usize)>;

    async fn pending_count(&self) -> usize;
}
