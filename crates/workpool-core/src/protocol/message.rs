//! Messages exchanged with forked workers.
//!
//! A message is newline-separated text:
//!
//! - bootstrap: `"CALLBACK\n<handler name>\n<args JSON>"`
//! - request:   `"<taskId>\n<payload JSON>"`
//! - success:   `"<taskId>\n<result JSON>"`
//! - failure:   `"<taskId>\nERR\n<error text>"`
//!
//! Because messages span lines, each one travels over the pipe as a single
//! JSON string literal terminated by `\n` (see [`encode_frame`]).

use serde_json::Value;

use crate::error::{Error, Result};

/// First line of the bootstrap message.
pub const BOOTSTRAP_TAG: &str = "CALLBACK";

/// Marks a failure reply.
pub const ERROR_MARKER: &str = "ERR";

/// Host -> worker message.
#[derive(Debug, Clone, PartialEq)]
pub enum HostMessage {
    /// Install the named handler with its arguments.
    Bootstrap { handler: String, args: Value },
    /// Run the installed handler on `payload`.
    Request { task_id: String, payload: Value },
}

impl HostMessage {
    pub fn encode(&self) -> Result<String> {
        match self {
            Self::Bootstrap { handler, args } => {
                if handler.contains('\n') {
                    return Err(Error::Protocol(format!(
                        "handler name {handler:?} contains a newline"
                    )));
                }
                Ok(format!(
                    "{BOOTSTRAP_TAG}\n{handler}\n{}",
                    serde_json::to_string(args)?
                ))
            }
            Self::Request { task_id, payload } => {
                Ok(format!("{task_id}\n{}", serde_json::to_string(payload)?))
            }
        }
    }

    pub fn decode(text: &str) -> Result<Self> {
        let (head, rest) = text
            .split_once('\n')
            .ok_or_else(|| Error::Protocol("message has no body".to_string()))?;

        if head == BOOTSTRAP_TAG {
            let (handler, args) = rest.split_once('\n').unwrap_or((rest, ""));
            let args = if args.trim().is_empty() {
                Value::Null
            } else {
                serde_json::from_str(args)?
            };
            return Ok(Self::Bootstrap {
                handler: handler.to_string(),
                args,
            });
        }

        Ok(Self::Request {
            task_id: head.to_string(),
            payload: serde_json::from_str(rest)?,
        })
    }
}

/// Worker -> host message.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerReply {
    Success { task_id: String, body: Value },
    Failure { task_id: String, error: String },
}

impl WorkerReply {
    pub fn task_id(&self) -> &str {
        match self {
            Self::Success { task_id, .. } | Self::Failure { task_id, .. } => task_id,
        }
    }

    pub fn encode(&self) -> Result<String> {
        match self {
            Self::Success { task_id, body } => {
                Ok(format!("{task_id}\n{}", serde_json::to_string(body)?))
            }
            Self::Failure { task_id, error } => Ok(format!("{task_id}\n{ERROR_MARKER}\n{error}")),
        }
    }

    pub fn decode(text: &str) -> Result<Self> {
        let (task_id, rest) = text
            .split_once('\n')
            .ok_or_else(|| Error::Protocol("reply has no body".to_string()))?;
        let task_id = task_id.to_string();

        if rest == ERROR_MARKER {
            return Ok(Self::Failure {
                task_id,
                error: String::new(),
            });
        }
        if let Some(error) = rest.strip_prefix("ERR\n") {
            return Ok(Self::Failure {
                task_id,
                error: error.to_string(),
            });
        }

        Ok(Self::Success {
            task_id,
            body: serde_json::from_str(rest)?,
        })
    }
}

/// Wrap a message as one line: a JSON string literal plus `\n`.
pub fn encode_frame(message: &str) -> Result<String> {
    let mut frame = serde_json::to_string(message)?;
    frame.push('\n');
    Ok(frame)
}

/// Unwrap a line produced by [`encode_frame`].
pub fn decode_frame(line: &str) -> Result<String> {
    let line = line.trim_end_matches(['\r', '\n']);
    serde_json::from_str::<String>(line)
        .map_err(|e| Error::Protocol(format!("bad frame: {e}")))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn bootstrap_carries_name_and_args() {
        let msg = HostMessage::Bootstrap {
            handler: "fail".to_string(),
            args: json!({"message": "nope"}),
        };
        let text = msg.encode().unwrap();
        assert_eq!(text, "CALLBACK\nfail\n{\"message\":\"nope\"}");
        assert_eq!(HostMessage::decode(&text).unwrap(), msg);
    }

    #[test]
    fn bootstrap_without_args_decodes_to_null() {
        assert_eq!(
            HostMessage::decode("CALLBACK\necho").unwrap(),
            HostMessage::Bootstrap {
                handler: "echo".to_string(),
                args: Value::Null,
            }
        );
    }

    #[test]
    fn request_layout() {
        let msg = HostMessage::Request {
            task_id: "abc".to_string(),
            payload: json!([1, 2]),
        };
        assert_eq!(msg.encode().unwrap(), "abc\n[1,2]");
    }

    #[test]
    fn failure_keeps_multiline_text_verbatim() {
        let reply = WorkerReply::decode("abc\nERR\nboom\n  at handler\n  at main").unwrap();
        assert_eq!(
            reply,
            WorkerReply::Failure {
                task_id: "abc".to_string(),
                error: "boom\n  at handler\n  at main".to_string(),
            }
        );
    }

    #[test]
    fn success_reply_parses_json_body() {
        let reply = WorkerReply::decode("abc\n{\"ok\":true}").unwrap();
        assert_eq!(reply.task_id(), "abc");
        assert_eq!(
            reply,
            WorkerReply::Success {
                task_id: "abc".to_string(),
                body: json!({"ok": true}),
            }
        );
    }

    #[test]
    fn reply_without_newline_is_protocol_error() {
        assert!(matches!(
            WorkerReply::decode("abc"),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn frame_is_a_single_line() {
        let frame = encode_frame("id\nERR\nline one\nline two").unwrap();
        assert_eq!(frame.matches('\n').count(), 1);
        assert!(frame.ends_with('\n'));
        assert_eq!(decode_frame(&frame).unwrap(), "id\nERR\nline one\nline two");
    }

    #[test]
    fn garbage_frame_is_rejected() {
        assert!(decode_frame("not a json string").is_err());
    }
}
