//! Workpool Core Library
//!
//! Shared functionality for the workpool host and its worker processes:
//! - Wire codecs for stream workers and forked workers
//! - Configuration resolution and hierarchy
//! - Tracing initialization
//! - Common error types

pub mod config;
pub mod error;
pub mod protocol;
pub mod tracing_init;

pub use config::Config;
pub use error::{Error, Result};
