//! Tolerant parser for inbound frames.
//!
//! Implements the tolerant reader pattern: unknown fields are ignored and
//! frames of unknown shape come back as [`Inbound::Unknown`], so one odd
//! line never takes the session down.

use serde_json::Value;

use super::types::{Inbound, Notification, Response, ResponseError};
use crate::error::{Error, Result};

/// Parse a single line from the server's stdout.
pub fn parse_line(line: &str) -> Result<Inbound> {
    let raw: Value = serde_json::from_str(line)
        .map_err(|e| Error::Protocol(format!("invalid JSON frame: {e}")))?;
    parse_value(raw)
}

/// Classify a JSON value into a canonical inbound frame.
///
/// A frame carrying a numeric `id` is a response even when it also carries
/// a `method`: servers that echo request frames back keep their ids, and
/// the id is what routes the frame to a waiting caller.
pub fn parse_value(raw: Value) -> Result<Inbound> {
    if !raw.is_object() {
        return Err(Error::Protocol("frame is not a JSON object".into()));
    }

    if let Some(id) = raw.get("id").and_then(Value::as_u64) {
        return Ok(Inbound::Response(parse_response(id, raw)));
    }

    if let Some(method) = raw.get("method").and_then(Value::as_str) {
        let method = method.to_string();
        let params = raw.get("params").cloned().unwrap_or(Value::Null);
        return Ok(Inbound::Notification(Notification { method, params }));
    }

    Ok(Inbound::Unknown { payload: raw })
}

fn parse_response(id: u64, raw: Value) -> Response {
    let error = raw.get("error").map(|e| ResponseError {
        code: e.get("code").and_then(Value::as_i64).unwrap_or(0),
        message: e
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string(),
        data: e.get("data").cloned(),
    });

    let payload = raw.get("result").cloned().unwrap_or(raw);

    Response { id, error, payload }
}
