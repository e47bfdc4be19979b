//! zenbridge Bridge Library
//!
//! Core functionality for the zenbridge bridge:
//! - Process supervision for the Zen-C toolchain server
//! - Stream multiplexing over the server's stdio
//! - Command facade for one-shot toolchain invocations
//! - Bridge composition root exposed to editor integrations

pub mod bridge;
pub mod facade;
pub mod multiplexer;
pub mod supervisor;
pub mod terminal;
pub mod watcher;
