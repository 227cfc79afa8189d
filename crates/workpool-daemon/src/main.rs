//! Workpool Daemon
//!
//! `run` starts one pool and feeds it JSON payloads read line by line from
//! stdin, printing each result as a JSON line. `worker` is the entrypoint
//! of forked workers and is not meant to be called by hand.

use std::sync::Arc;

use anyhow::Context as _;
use clap::{Args, Parser, Subcommand};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{info, warn};

use workpool_core::config::{Config, load_config};
use workpool_daemon::manager::{ProcessManager, WorkerArgs};
use workpool_daemon::pool::{HandlerSpec, PoolOptions, WorkerCommand};
use workpool_daemon::worker::{HandlerRegistry, run_worker};

#[derive(Parser, Debug)]
#[command(name = "workpool-daemon")]
#[command(version, about = "Workpool - out-of-process worker pools")]
struct Cli {
    /// Log level filter (e.g. "info", "debug", "warn"). Overrides config.
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a pool and answer JSON payloads read from stdin.
    Run(RunArgs),

    /// Forked worker entrypoint.
    #[command(hide = true)]
    Worker,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Pool kind: "Spawn" (external command) or "Query" (forked handler).
    #[arg(long, default_value = "Spawn")]
    kind: String,

    /// Number of workers (defaults to pools.default_workers).
    #[arg(long, short = 'w')]
    workers: Option<usize>,

    /// Handler forked workers run.
    #[arg(long, default_value = "echo")]
    handler: String,

    /// JSON arguments installed with the handler.
    #[arg(long)]
    handler_args: Option<String>,

    /// Pool name used in logs.
    #[arg(long, default_value = "main")]
    name: String,

    /// Worker command for Spawn pools.
    #[arg(last = true)]
    command: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Worker => {
            let level = cli.log_level.as_deref().unwrap_or("warn");
            workpool_core::tracing_init::init_tracing(
                &format!("workpool_daemon={level}"),
                cli.log_json,
            );
            run_worker(
                Arc::new(HandlerRegistry::with_builtins()),
                tokio::io::stdin(),
                tokio::io::stdout(),
            )
            .await
        }
        Command::Run(args) => {
            let cwd = std::env::current_dir().ok();
            let mut config = load_config(cwd.as_deref())?;
            if let Some(level) = cli.log_level {
                config.daemon.log_level = level;
            }
            config.daemon.log_json |= cli.log_json;
            workpool_core::tracing_init::init_tracing(
                &format!("workpool_daemon={}", config.daemon.log_level),
                config.daemon.log_json,
            );
            run(config, args).await
        }
    }
}

fn worker_args(args: &RunArgs) -> anyhow::Result<WorkerArgs> {
    if let Some(command) = WorkerCommand::from_argv(&args.command) {
        return Ok(command.into());
    }
    let handler_args = match &args.handler_args {
        Some(raw) => serde_json::from_str(raw).context("--handler-args is not valid JSON")?,
        None => Value::Null,
    };
    Ok(HandlerSpec::new(args.handler.clone(), handler_args).into())
}

async fn run(config: Config, args: RunArgs) -> anyhow::Result<()> {
    let options = PoolOptions::from_config(&config.pools)?;
    let manager = ProcessManager::new(options);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        kind = %args.kind,
        workers = args.workers.unwrap_or(config.pools.default_workers),
        "Starting workpool-daemon"
    );

    let pool = manager
        .spawn(&args.name, &args.kind, worker_args(&args)?, args.workers)
        .await?;
    if pool.worker_count().await == 0 {
        manager.destroy().await;
        anyhow::bail!("No worker of pool {} could be started", args.name);
    }

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let printer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = out_rx.recv().await {
            stdout.write_all(line.as_bytes()).await?;
            stdout.flush().await?;
        }
        anyhow::Ok(())
    });

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    let mut queries = JoinSet::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut line_no: u64 = 0;
    let mut interrupted = false;
    let mut signals_failed = false;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                line_no += 1;
                if line.trim().is_empty() {
                    continue;
                }
                let n = line_no;
                let payload: Value = match serde_json::from_str(&line) {
                    Ok(payload) => payload,
                    Err(e) => {
                        let _ = out_tx.send(output_line(&json!({"line": n, "error": format!("Invalid JSON: {e}")})));
                        continue;
                    }
                };
                let pool = Arc::clone(&pool);
                let out_tx = out_tx.clone();
                queries.spawn(async move {
                    let out = match pool.query(payload).await {
                        Ok(result) => json!({"line": n, "result": result}),
                        Err(e) => json!({"line": n, "error": e.to_string()}),
                    };
                    let _ = out_tx.send(output_line(&out));
                });
            }
            signal = &mut shutdown, if !signals_failed => {
                match signal {
                    Ok(name) => {
                        info!(signal = name, "Received shutdown signal");
                        interrupted = true;
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to listen for shutdown signals");
                        signals_failed = true;
                    }
                }
            }
        }
    }

    // On a signal, destroying first rejects whatever is still pending.
    if interrupted {
        manager.destroy().await;
    }
    while let Some(joined) = queries.join_next().await {
        if let Err(e) = joined {
            warn!(error = %e, "Query task failed");
        }
    }
    manager.destroy().await;

    drop(out_tx);
    printer.await??;
    info!(requests = line_no, "Daemon stopped");
    Ok(())
}

fn output_line(value: &Value) -> String {
    let mut line = value.to_string();
    line.push('\n');
    line
}

async fn shutdown_signal() -> anyhow::Result<&'static str> {
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                Ok("ctrl-c")
            }
            _ = sigterm.recv() => Ok("sigterm"),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        Ok("ctrl-c")
    }
}
