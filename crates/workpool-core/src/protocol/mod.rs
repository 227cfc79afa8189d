//! Wire codecs for talking to worker processes.
//!
//! - [`stream`]: the line-oriented `"<id>|<json>"` protocol spoken by arbitrary
//!   external executables over stdin/stdout.
//! - [`message`]: the structured messages exchanged with forked re-executions
//!   of the host binary, plus the framing that carries them over a pipe.
//!
//! Both readers are tolerant: anything that does not decode is reported to
//! the caller as a value, never as a panic.

pub mod message;
pub mod stream;

pub use message::{HostMessage, WorkerReply, decode_frame, encode_frame};
pub use stream::{StreamLine, encode_request, parse_line};
