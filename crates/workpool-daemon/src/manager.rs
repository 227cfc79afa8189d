//! Process manager: the registry of named pools.
//!
//! [`ProcessManager`] is built once at startup and handed to whoever needs
//! pools. It turns a symbolic kind (`"Spawn"` or `"Query"`) plus worker
//! arguments into a running pool, keeps every pool it created, and tears
//! them all down on [`ProcessManager::destroy`].

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::pool::{
    ForkedPool, HandlerSpec, PoolError, PoolKind, PoolOptions, StreamPool, WorkerCommand,
    WorkerPool,
};

/// What a pool's workers run.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerArgs {
    /// Executable and arguments, for `"Spawn"` pools.
    Command(WorkerCommand),
    /// Pre-registered handler, for `"Query"` pools.
    Handler(HandlerSpec),
}

impl From<WorkerCommand> for WorkerArgs {
    fn from(command: WorkerCommand) -> Self {
        Self::Command(command)
    }
}

impl From<HandlerSpec> for WorkerArgs {
    fn from(spec: HandlerSpec) -> Self {
        Self::Handler(spec)
    }
}

/// Errors from the process manager.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("Invalid pool type: {kind}")]
    InvalidPoolKind { kind: String },

    #[error("Pool already exists: {name}")]
    PoolExists { name: String },

    #[error("Pool not found: {name}")]
    PoolNotFound { name: String },

    #[error(transparent)]
    Pool(#[from] PoolError),
}

type PoolMap = HashMap<String, Arc<dyn WorkerPool>>;

/// Owner of every pool created through it.
pub struct ProcessManager {
    pools: Arc<RwLock<PoolMap>>,
    options: PoolOptions,
}

impl ProcessManager {
    pub fn new(options: PoolOptions) -> Self {
        Self {
            pools: Arc::new(RwLock::new(HashMap::new())),
            options,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(PoolOptions::default())
    }

    pub const fn options(&self) -> &PoolOptions {
        &self.options
    }

    /// Create a pool named `name`, launch `count` workers (default
    /// [`PoolOptions::default_workers`]) and register it.
    ///
    /// Launch failures do not fail this call; they leave the pool with fewer
    /// workers. Workers are launched without holding the registry lock; if
    /// the name was taken meanwhile, the new pool is destroyed again.
    pub async fn spawn(
        &self,
        name: &str,
        kind: &str,
        args: impl Into<WorkerArgs>,
        count: Option<usize>,
    ) -> Result<Arc<dyn WorkerPool>, ManagerError> {
        let kind = parse_kind(kind)?;
        if self.pools.read().await.contains_key(name) {
            return Err(ManagerError::PoolExists {
                name: name.to_string(),
            });
        }

        let pool = self.build(name, kind, args.into())?;
        let count = count.unwrap_or(self.options.default_workers);
        pool.spawn(count).await;
        let workers = pool.worker_count().await;

        let inserted = match self.pools.write().await.entry(name.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&pool));
                true
            }
            Entry::Occupied(_) => false,
        };
        if !inserted {
            pool.destroy().await;
            return Err(ManagerError::PoolExists {
                name: name.to_string(),
            });
        }

        info!(pool = %name, %kind, requested = count, workers, "Pool created");
        Ok(pool)
    }

    /// Swap in a freshly built pool under `name` and destroy the one it
    /// replaces, if any.
    ///
    /// The new pool is fully spawned before the swap, so lookups never see a
    /// missing entry. Requests still pending on the old pool are rejected
    /// with [`PoolError::PoolDestroyed`].
    pub async fn replace(
        &self,
        name: &str,
        kind: &str,
        args: impl Into<WorkerArgs>,
        count: Option<usize>,
    ) -> Result<Arc<dyn WorkerPool>, ManagerError> {
        let kind = parse_kind(kind)?;
        let pool = self.build(name, kind, args.into())?;
        pool.spawn(count.unwrap_or(self.options.default_workers))
            .await;

        let old = self
            .pools
            .write()
            .await
            .insert(name.to_string(), Arc::clone(&pool));
        if let Some(old) = old {
            old.destroy().await;
            info!(pool = %name, %kind, "Pool replaced");
        } else {
            info!(pool = %name, %kind, "Pool created");
        }
        Ok(pool)
    }

    fn build(
        &self,
        name: &str,
        kind: PoolKind,
        args: WorkerArgs,
    ) -> Result<Arc<dyn WorkerPool>, PoolError> {
        let options = self.options.clone();
        match (kind, args) {
            (PoolKind::Stream, WorkerArgs::Command(command)) => {
                Ok(Arc::new(StreamPool::new(name, command, options)))
            }
            (PoolKind::Forked, WorkerArgs::Handler(spec)) => {
                Ok(Arc::new(ForkedPool::new(name, spec, options)))
            }
            (PoolKind::Stream, WorkerArgs::Handler(spec)) => Err(PoolError::InvalidWorkerArgs {
                kind,
                reason: format!("expected a command, got handler {}", spec.name),
            }),
            (PoolKind::Forked, WorkerArgs::Command(command)) => {
                Err(PoolError::InvalidWorkerArgs {
                    kind,
                    reason: format!(
                        "expected a handler, got command {}",
                        command.program.display()
                    ),
                })
            }
        }
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn WorkerPool>> {
        self.pools.read().await.get(name).cloned()
    }

    /// Names of all registered pools, sorted.
    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pools.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn len(&self) -> usize {
        self.pools.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.pools.read().await.is_empty()
    }

    /// Unregister and destroy one pool.
    pub async fn remove(&self, name: &str) -> Result<(), ManagerError> {
        let pool = self
            .pools
            .write()
            .await
            .remove(name)
            .ok_or_else(|| ManagerError::PoolNotFound {
                name: name.to_string(),
            })?;
        pool.destroy().await;
        info!(pool = %name, "Pool removed");
        Ok(())
    }

    /// Destroy and unregister every pool. Safe to call repeatedly.
    pub async fn destroy(&self) {
        let drained: Vec<(String, Arc<dyn WorkerPool>)> =
            self.pools.write().await.drain().collect();
        if drained.is_empty() {
            return;
        }
        for (name, pool) in &drained {
            let pending = pool.pending_count().await;
            if pending > 0 {
                warn!(pool = %name, pending, "Destroying pool with pending tasks");
            }
            pool.destroy().await;
        }
        info!(pools = drained.len(), "All pools destroyed");
    }
}

fn parse_kind(kind: &str) -> Result<PoolKind, ManagerError> {
    PoolKind::parse(kind).ok_or_else(|| ManagerError::InvalidPoolKind {
        kind: kind.to_string(),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn missing_command() -> WorkerCommand {
        WorkerCommand::new("/nonexistent/workpool-test-binary", Vec::new())
    }

    #[tokio::test]
    async fn unknown_kind_is_rejected() {
        let manager = ProcessManager::with_defaults();
        let err = manager
            .spawn("p", "Thread", missing_command(), None)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ManagerError::InvalidPoolKind { ref kind } if kind == "Thread"));
        assert_eq!(err.to_string(), "Invalid pool type: Thread");
        assert!(manager.is_empty().await);
    }

    #[tokio::test]
    async fn mismatched_args_are_rejected() {
        let manager = ProcessManager::with_defaults();
        let err = manager
            .spawn("p", "Spawn", HandlerSpec::new("echo", Value::Null), None)
            .await
            .err()
            .unwrap();
        assert!(matches!(
            err,
            ManagerError::Pool(PoolError::InvalidWorkerArgs {
                kind: PoolKind::Stream,
                ..
            })
        ));
        assert!(manager.is_empty().await);
    }

    #[tokio::test]
    async fn names_are_unique() {
        let manager = ProcessManager::with_defaults();
        let pool = manager
            .spawn("model", "spawn", missing_command(), Some(1))
            .await
            .unwrap();
        assert_eq!(pool.kind(), PoolKind::Stream);
        assert_eq!(pool.worker_count().await, 0);

        let err = manager
            .spawn("model", "Query", HandlerSpec::new("echo", Value::Null), None)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ManagerError::PoolExists { ref name } if name == "model"));
        assert_eq!(manager.names().await, vec!["model"]);
    }

    #[tokio::test]
    async fn remove_and_destroy() {
        let manager = ProcessManager::with_defaults();
        manager
            .spawn("b", "Spawn", missing_command(), None)
            .await
            .unwrap();
        manager
            .spawn("a", "Spawn", missing_command(), None)
            .await
            .unwrap();
        assert_eq!(manager.names().await, vec!["a", "b"]);

        manager.remove("a").await.unwrap();
        assert!(matches!(
            manager.remove("a").await,
            Err(ManagerError::PoolNotFound { .. })
        ));

        manager.destroy().await;
        manager.destroy().await;
        assert!(manager.is_empty().await);
        assert!(manager.get("b").await.is_none());
    }

    #[tokio::test]
    async fn replace_swaps_the_entry() {
        let manager = ProcessManager::with_defaults();
        let first = manager
            .spawn("p", "Spawn", missing_command(), None)
            .await
            .unwrap();
        let second = manager
            .replace("p", "Query", HandlerSpec::new("echo", Value::Null), Some(0))
            .await
            .unwrap();

        assert_eq!(first.kind(), PoolKind::Stream);
        let current = manager.get("p").await.unwrap();
        assert_eq!(current.kind(), PoolKind::Forked);
        assert!(Arc::ptr_eq(&current, &second));
        assert_eq!(manager.len().await, 1);
    }

    #[tokio::test]
    async fn racing_spawns_register_one_pool() {
        let manager = Arc::new(ProcessManager::with_defaults());
        let mut racers = tokio::task::JoinSet::new();
        for _ in 0..4 {
            let manager = Arc::clone(&manager);
            racers.spawn(async move {
                manager
                    .spawn("shared", "Spawn", missing_command(), Some(1))
                    .await
                    .is_ok()
            });
        }

        let mut created = 0;
        while let Some(joined) = racers.join_next().await {
            if joined.unwrap() {
                created += 1;
            }
        }
        assert_eq!(created, 1);
        assert_eq!(manager.names().await, vec!["shared"]);
    }

    #[tokio::test]
    async fn registry_stays_readable_while_workers_launch() {
        let manager = Arc::new(ProcessManager::with_defaults());
        manager
            .spawn("existing", "Spawn", missing_command(), None)
            .await
            .unwrap();

        let spawner = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                manager
                    .spawn("big", "Spawn", missing_command(), Some(200))
                    .await
                    .is_ok()
            })
        };
        tokio::task::yield_now().await;
        assert!(manager.get("existing").await.is_some());
        assert!(spawner.await.unwrap());
    }
}
