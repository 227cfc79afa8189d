//! Line protocol for stream workers.
//!
//! Requests are `"<taskId>|<payload JSON>\n"`. A worker answers with
//! `"<taskId>|<result JSON>"`, or gives up entirely with
//! `"error|<diagnostic JSON>"`.

use serde_json::Value;

use crate::error::Result;

/// Reserved token announcing that the worker can no longer serve requests.
pub const FATAL_TOKEN: &str = "error";

/// One classified line of worker output.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamLine {
    /// Result for a task.
    Response { task_id: u64, body: Value },
    /// Addressed to a task, but the body is not valid JSON.
    BadResponse { task_id: u64, reason: String },
    /// The worker reported a fatal failure.
    Fatal { diagnostic: Value },
    /// Anything else (banners, blank lines, stray prints).
    Unrecognized { reason: String },
}

/// Encode a request line, newline included.
pub fn encode_request(task_id: u64, payload: &Value) -> Result<String> {
    let body = serde_json::to_string(payload)?;
    Ok(format!("{task_id}|{body}\n"))
}

/// Classify a single line read from a worker's stdout.
pub fn parse_line(line: &str) -> StreamLine {
    let line = line.trim_end();
    let Some((token, body)) = line.split_once('|') else {
        return StreamLine::Unrecognized {
            reason: "missing '|' separator".to_string(),
        };
    };

    if token == FATAL_TOKEN {
        // Diagnostics are informational; keep raw text when it isn't JSON.
        let diagnostic =
            serde_json::from_str(body).unwrap_or_else(|_| Value::String(body.to_string()));
        return StreamLine::Fatal { diagnostic };
    }

    let Ok(task_id) = token.parse::<u64>() else {
        return StreamLine::Unrecognized {
            reason: format!("unknown token {token:?}"),
        };
    };

    match serde_json::from_str(body) {
        Ok(body) => StreamLine::Response { task_id, body },
        Err(e) => StreamLine::BadResponse {
            task_id,
            reason: e.to_string(),
        },
    }
}
