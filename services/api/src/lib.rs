//! Lexis API Library Crate
//!
//! The WebSocket service that hosts one practice session per connection and
//! wires the `lexis-core` session-control core to real model providers. The
//! `api` binary is a thin wrapper around this library.

pub mod config;
pub mod models;
pub mod router;
pub mod state;
pub mod ws;
