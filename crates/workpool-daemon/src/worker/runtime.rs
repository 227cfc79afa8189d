//! Request loop of a forked worker.

use std::sync::Arc;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, info, warn};

use workpool_core::protocol::{HostMessage, WorkerReply, decode_frame, encode_frame};

use super::handlers::{Handler, HandlerRegistry};

/// Serve host messages from `input` until EOF, writing replies to `output`.
///
/// Requests run concurrently, so replies may leave in a different order
/// than requests arrived. A request that comes before a valid bootstrap
/// message is answered with an error reply. On EOF, handlers still running
/// are awaited and every reply is flushed before returning.
pub async fn run_worker<R, W>(
    registry: Arc<HandlerRegistry>,
    input: R,
    output: W,
) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (reply_tx, reply_rx) = mpsc::unbounded_channel::<WorkerReply>();
    let writer = tokio::spawn(write_replies(output, reply_rx));

    let mut current: Result<(Handler, Arc<Value>), String> =
        Err("no handler installed".to_string());
    let mut running = JoinSet::new();
    let mut lines = BufReader::new(input).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let message = match decode_frame(&line).and_then(|text| HostMessage::decode(&text)) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Ignoring unreadable host message");
                continue;
            }
        };

        match message {
            HostMessage::Bootstrap { handler, args } => {
                current = match registry.get(&handler) {
                    Some(h) => {
                        info!(handler = %handler, "Handler installed");
                        Ok((h, Arc::new(args)))
                    }
                    None => {
                        warn!(handler = %handler, "Unknown handler");
                        Err(format!("unknown handler: {handler}"))
                    }
                };
            }
            HostMessage::Request { task_id, payload } => match &current {
                Ok((handler, args)) => {
                    let handler = Arc::clone(handler);
                    let args = Arc::clone(args);
                    let reply_tx = reply_tx.clone();
                    running.spawn(async move {
                        // Spawned separately so a panic comes back as a JoinError.
                        let reply = match tokio::spawn(handler(args, payload)).await {
                            Ok(Ok(body)) => WorkerReply::Success { task_id, body },
                            Ok(Err(e)) => WorkerReply::Failure {
                                task_id,
                                error: format!("{e:#}"),
                            },
                            Err(e) => {
                                warn!(task_id = %task_id, error = %e, "Handler did not finish");
                                WorkerReply::Failure {
                                    task_id,
                                    error: failure_text(e),
                                }
                            }
                        };
                        let _ = reply_tx.send(reply);
                    });
                }
                Err(reason) => {
                    let _ = reply_tx.send(WorkerReply::Failure {
                        task_id,
                        error: reason.clone(),
                    });
                }
            },
        }

        // Reap finished handlers so the set does not grow without bound.
        while let Some(joined) = running.try_join_next() {
            if let Err(e) = joined {
                warn!(error = %e, "Handler task failed");
            }
        }
    }

    debug!(in_flight = running.len(), "Host closed stdin, draining");
    while let Some(joined) = running.join_next().await {
        if let Err(e) = joined {
            warn!(error = %e, "Handler task failed");
        }
    }
    drop(reply_tx);
    writer.await??;
    Ok(())
}

fn failure_text(err: JoinError) -> String {
    if !err.is_panic() {
        return format!("handler was cancelled: {err}");
    }
    let payload = err.into_panic();
    let message = payload
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string());
    format!("handler panicked: {message}")
}

async fn write_replies<W>(
    mut output: W,
    mut replies: mpsc::UnboundedReceiver<WorkerReply>,
) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(reply) = replies.recv().await {
        let frame = match reply.encode().and_then(|text| encode_frame(&text)) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(task_id = %reply.task_id(), error = %e, "Failed to encode reply");
                continue;
            }
        };
        output.write_all(frame.as_bytes()).await?;
        output.flush().await?;
    }
    output.shutdown().await?;
    Ok(())
}
