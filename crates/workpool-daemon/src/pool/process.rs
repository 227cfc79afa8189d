//! Child process plumbing shared by both pool variants.
//!
//! A launched worker is driven by three tasks:
//! - a stdin writer that drains the handle's channel into the pipe,
//! - a stdout reader owned by the pool (protocol specific),
//! - an exit watcher that owns the [`Child`] and reaps it.
//!
//! The watcher reports a worker as lost when it exits on its own or when
//! its stdin can no longer be written.

use std::future::Future;
use std::process::ExitStatus;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::worker::{WorkerHandle, WorkerId};

/// A freshly started worker, before its pool wires up the readers.
pub(crate) struct Launched {
    pub handle: WorkerHandle,
    pub child: Child,
    pub stdout: ChildStdout,
    pub stderr: Option<ChildStderr>,
    pub shutdown_rx: oneshot::Receiver<()>,
    /// Fires if a write to the worker's stdin fails.
    pub broken_rx: oneshot::Receiver<()>,
}

/// Why a worker left its pool without being disconnected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lost {
    /// The process exited; `None` if its status could not be read.
    Exited(Option<ExitStatus>),
    /// Its stdin pipe broke while the process may still be running.
    StdinClosed,
}

/// Line reader that survives bytes which are not UTF-8.
///
/// Invalid sequences are replaced with U+FFFD. Reading stops only at EOF or
/// on an I/O error.
pub(crate) struct LossyLines<R> {
    reader: BufReader<R>,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> LossyLines<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            buf: Vec::new(),
        }
    }

    pub async fn next_line(&mut self) -> Option<String> {
        self.buf.clear();
        match self.reader.read_until(b'\n', &mut self.buf).await {
            Ok(0) => None,
            Ok(_) => {
                let line = String::from_utf8_lossy(&self.buf);
                if let std::borrow::Cow::Owned(_) = line {
                    debug!(bytes = self.buf.len(), "Replaced invalid UTF-8 in worker output");
                }
                Some(line.trim_end_matches(['\r', '\n']).to_string())
            }
            Err(e) => {
                warn!(error = %e, "Failed to read worker output");
                None
            }
        }
    }
}

/// Start `command` with piped stdin/stdout and spawn its stdin writer.
pub(crate) fn launch(mut command: Command, id: WorkerId) -> std::io::Result<Launched> {
    command
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn()?;
    let pid = child.id();

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| std::io::Error::other("Failed to capture stdin"))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| std::io::Error::other("Failed to capture stdout"))?;
    let stderr = child.stderr.take();

    let (stdin_tx, mut stdin_rx) = mpsc::unbounded_channel::<String>();
    let (broken_tx, broken_rx) = oneshot::channel();
    tokio::spawn(async move {
        let mut stdin = stdin;
        while let Some(data) = stdin_rx.recv().await {
            let written = match stdin.write_all(data.as_bytes()).await {
                Ok(()) => stdin.flush().await,
                Err(e) => Err(e),
            };
            if let Err(e) = written {
                warn!(worker = %id, error = %e, "Failed to write to worker stdin");
                let _ = broken_tx.send(());
                break;
            }
        }
        debug!(worker = %id, "stdin writer finished");
    });

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    Ok(Launched {
        handle: WorkerHandle::new(id, pid, stdin_tx, shutdown_tx),
        child,
        stdout,
        stderr,
        shutdown_rx,
        broken_rx,
    })
}

/// Reap `child`.
///
/// If the process exits on its own, waits (bounded) for the stdout reader to
/// drain the last responses and then calls `on_lost`. If its stdin breaks,
/// calls `on_lost` right away and then terminates it. If the pool
/// disconnects it first, gives it `terminate_timeout` to exit after stdin
/// closes and kills it otherwise.
pub(crate) fn watch_exit<F, Fut>(
    mut child: Child,
    mut shutdown_rx: oneshot::Receiver<()>,
    mut broken_rx: oneshot::Receiver<()>,
    reader: JoinHandle<()>,
    id: WorkerId,
    terminate_timeout: Duration,
    on_lost: F,
) where
    F: FnOnce(Lost) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        tokio::select! {
            biased;
            _ = &mut shutdown_rx => {
                terminate(&mut child, id, terminate_timeout).await;
            }
            Ok(()) = &mut broken_rx => {
                on_lost(Lost::StdinClosed).await;
                terminate(&mut child, id, terminate_timeout).await;
            }
            status = child.wait() => {
                let status = match status {
                    Ok(status) => Some(status),
                    Err(e) => {
                        warn!(worker = %id, error = %e, "Error waiting for worker");
                        None
                    }
                };
                if tokio::time::timeout(terminate_timeout, reader).await.is_err() {
                    warn!(worker = %id, "stdout still open after exit");
                }
                on_lost(Lost::Exited(status)).await;
            }
        }
    });
}

async fn terminate(child: &mut Child, id: WorkerId, timeout: Duration) {
    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => {
            info!(worker = %id, ?status, "Worker exited after disconnect");
        }
        Ok(Err(e)) => {
            warn!(worker = %id, error = %e, "Error waiting for worker");
            child.kill().await.ok();
        }
        Err(_) => {
            warn!(worker = %id, "Timeout waiting for graceful shutdown, killing");
            child.kill().await.ok();
        }
    }
}
