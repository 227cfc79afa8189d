#![allow(clippy::unwrap_used)] // Integration tests use unwrap for brevity

//! Forked pools running this crate's own binary as the worker.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::task::JoinSet;

use workpool_daemon::pool::{ForkedPool, HandlerSpec, PoolError, PoolOptions, WorkerPool};

fn options() -> PoolOptions {
    PoolOptions {
        terminate_timeout: Duration::from_secs(2),
        worker_program: Some(PathBuf::from(env!("CARGO_BIN_EXE_workpool-daemon"))),
        ..PoolOptions::default()
    }
}

fn pool(handler: &str, args: Value) -> ForkedPool {
    ForkedPool::new("forked", HandlerSpec::new(handler, args), options())
}

async fn within<F: Future>(fut: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(15), fut)
        .await
        .unwrap()
}

#[tokio::test]
async fn echo_round_trip_under_concurrency() {
    let pool = Arc::new(pool("echo", Value::Null));
    pool.spawn(2).await;
    assert_eq!(pool.worker_count().await, 2);

    let mut queries = JoinSet::new();
    for i in 0..10 {
        let pool = Arc::clone(&pool);
        queries.spawn(async move { (i, pool.query(json!({"x": i})).await) });
    }
    while let Some(joined) = within(queries.join_next()).await {
        let (i, result) = joined.unwrap();
        assert_eq!(result.unwrap(), json!({"x": i}));
    }
    assert_eq!(pool.pending_count().await, 0);
    pool.destroy().await;
}

#[tokio::test]
async fn failure_text_is_delivered_verbatim() {
    let message = "Traceback (most recent call last):\n  File \"model.py\", line 3\nValueError: nope";
    let pool = pool("fail", json!({"message": message}));
    pool.spawn(1).await;

    let err = within(pool.query(json!({"x": 1}))).await.unwrap_err();
    assert_eq!(err, PoolError::Remote(message.to_string()));
    assert_eq!(err.to_string(), message);
    assert_eq!(pool.worker_count().await, 1);
    pool.destroy().await;
}

#[tokio::test]
async fn unknown_handler_rejects_requests() {
    let pool = pool("no_such_handler", Value::Null);
    pool.spawn(1).await;

    let err = within(pool.query(json!(1))).await.unwrap_err();
    assert_eq!(
        err,
        PoolError::Remote("unknown handler: no_such_handler".to_string())
    );
    pool.destroy().await;
}

#[tokio::test]
async fn fast_request_overtakes_slow_one() {
    let pool = pool("delayed_echo", Value::Null);
    pool.spawn(1).await;

    let slow = pool.submit(json!({"delay_ms": 2000})).await.unwrap();
    let fast = pool.submit(json!({"delay_ms": 0})).await.unwrap();
    assert_eq!(slow.worker(), fast.worker());
    assert_ne!(slow.task_id(), fast.task_id());
    assert!(uuid::Uuid::parse_str(fast.task_id()).is_ok());

    assert_eq!(within(fast).await.unwrap(), json!({"delay_ms": 0}));
    assert_eq!(pool.pending_count().await, 1);
    assert_eq!(within(slow).await.unwrap(), json!({"delay_ms": 2000}));
    pool.destroy().await;
}

#[tokio::test]
async fn destroy_is_idempotent() {
    let pool = pool("delayed_echo", json!({"delay_ms": 60_000}));
    pool.spawn(2).await;
    let pending = pool.submit(json!({})).await.unwrap();

    pool.destroy().await;
    pool.destroy().await;
    assert_eq!(pool.worker_count().await, 0);
    assert!(matches!(
        within(pending).await,
        Err(PoolError::PoolDestroyed { .. })
    ));
    assert!(matches!(
        pool.query(json!({})).await,
        Err(PoolError::NoWorkersAvailable { .. })
    ));
}

#[tokio::test]
async fn missing_worker_program_leaves_pool_empty() {
    let pool = ForkedPool::new(
        "ghost",
        HandlerSpec::new("echo", Value::Null),
        PoolOptions {
            worker_program: Some(PathBuf::from("/nonexistent/workpool-worker")),
            ..PoolOptions::default()
        },
    );
    pool.spawn(3).await;
    assert_eq!(pool.worker_count().await, 0);
}
