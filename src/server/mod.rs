//! HTTP admin server.
//!
//! - [`api`]: Router, shared state and route handlers
//! - [`streaming`]: SSE streaming of download progress

pub mod api;
pub mod streaming;
