//! Statically registered units of work a forked worker can run.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use serde_json::Value;

pub type HandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<Value>> + Send>>;

/// A handler receives the arguments it was installed with and one payload.
pub type Handler = Arc<dyn Fn(Arc<Value>, Value) -> HandlerFuture + Send + Sync>;

/// Handlers by name.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Handler>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.names())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the handlers this binary ships with:
    ///
    /// - `echo`: returns the payload.
    /// - `fail`: always fails with `args.message`.
    /// - `delayed_echo`: sleeps `payload.delay_ms` (else `args.delay_ms`)
    ///   milliseconds, then returns the payload.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("echo", |_args, payload| async move { Ok(payload) });
        registry.register("fail", |args, _payload| async move {
            let message = args
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("handler failed");
            Err(anyhow!("{message}"))
        });
        registry.register("delayed_echo", |args, payload| async move {
            let delay_ms = payload
                .get("delay_ms")
                .and_then(Value::as_u64)
                .or_else(|| args.get("delay_ms").and_then(Value::as_u64))
                .unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            Ok(payload)
        });
        registry
    }

    /// Register `handler` under `name`, replacing any previous one.
    pub fn register<F, Fut>(&mut self, name: impl Into<String>, handler: F)
    where
        F: Fn(Arc<Value>, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |args, payload| Box::pin(handler(args, payload)));
        self.handlers.insert(name.into(), handler);
    }

    pub fn get(&self, name: &str) -> Option<Handler> {
        self.handlers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn builtins_behave() {
        let registry = HandlerRegistry::with_builtins();
        assert_eq!(registry.names(), vec!["delayed_echo", "echo", "fail"]);

        let echo = registry.get("echo").unwrap();
        assert_eq!(
            echo(Arc::new(Value::Null), json!({"x": 1})).await.unwrap(),
            json!({"x": 1})
        );

        let fail = registry.get("fail").unwrap();
        let err = fail(Arc::new(json!({"message": "boom"})), json!(null))
            .await
            .unwrap_err();
        assert_eq!(format!("{err:#}"), "boom");
    }

    #[tokio::test]
    async fn delayed_echo_prefers_payload_delay() {
        let registry = HandlerRegistry::with_builtins();
        let handler = registry.get("delayed_echo").unwrap();
        let started = std::time::Instant::now();
        let out = handler(Arc::new(json!({"delay_ms": 5000})), json!({"delay_ms": 20}))
            .await
            .unwrap();
        assert_eq!(out, json!({"delay_ms": 20}));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn register_replaces() {
        let mut registry = HandlerRegistry::new();
        registry.register("x", |_, _| async { Ok(Value::Null) });
        registry.register("x", |_, p| async move { Ok(p) });
        assert_eq!(registry.names(), vec!["x"]);
        assert!(registry.get("y").is_none());
    }
}
