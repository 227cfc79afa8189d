//! Workpool Daemon Library
//!
//! Out-of-process task execution:
//! - Worker pools that multiplex concurrent requests onto long-lived
//!   worker processes with least-loaded routing
//! - Crash containment: dead workers are evicted and their tasks rejected
//! - A process manager owning every named pool
//! - The request loop run by forked workers

pub mod manager;
pub mod pool;
pub mod worker;

pub use manager::{ManagerError, ProcessManager, WorkerArgs};
pub use pool::{PendingResult, PoolError, PoolKind, PoolOptions, WorkerPool};
