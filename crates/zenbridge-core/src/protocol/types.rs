//! Frame types for the wire protocol.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outbound request frame, correlated by `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub method: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

/// Notification frame. Same shape in both directions: carries a method
/// and parameters but no correlation id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub method: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

/// Canonical inbound frames from the server's stdout.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Response(Response),
    Notification(Notification),
    Unknown { payload: Value },
}

/// Correlated response to an earlier request.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: u64,
    /// Error reported by the server, if any.
    pub error: Option<ResponseError>,
    /// The `result` field when present, otherwise the whole frame.
    pub payload: Value,
}

impl Response {
    /// Whether the server reported success for this request.
    pub const fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Structured error attached to a response frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseError {
    #[serde(default)]
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}
