//! Forked worker side: what runs inside a process started with the hidden
//! `worker` subcommand.
//!
//! The host installs one handler per process by name (see
//! [`HandlerRegistry`]), then streams requests that [`run_worker`] answers
//! concurrently.

mod handlers;
mod runtime;

pub use handlers::{Handler, HandlerFuture, HandlerRegistry};
pub use runtime::run_worker;
