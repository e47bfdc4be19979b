//! Line-delimited JSON wire protocol spoken by `zc lsp`.
//!
//! One JSON object per line. Outbound frames are requests (correlated by
//! id) or notifications (no id, no response expected). Inbound frames are
//! responses, server notifications, or anything else, tolerated and
//! logged by the caller, never fatal to the session.

pub mod parser;
pub mod types;

pub use parser::{parse_line, parse_value};
pub use types::{Inbound, Notification, Request, Response, ResponseError};
