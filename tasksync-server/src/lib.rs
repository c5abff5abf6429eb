//! `TaskSync` reference task service.
//!
//! Exposes the server for use in tests and embedding. The server accepts
//! WebSocket connections, authenticates each one as an account, and applies
//! task operations to that account's documents.

pub mod config;
pub mod server;
