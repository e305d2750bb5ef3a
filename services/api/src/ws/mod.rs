//! WebSocket Session Management
//!
//! This module contains the logic for hosting practice sessions over
//! WebSockets. It is structured into submodules:
//!
//! - `protocol`: the JSON message format for client-server communication.
//! - `session`: the connection lifecycle, from `join` to teardown.
//! - `cycle`: one agent reply, including tool calls in explanation mode.
//! - `rpc`: request/response calls to the client (toasts, closure).

mod cycle;
pub mod protocol;
pub mod rpc;
pub mod session;

pub use session::ws_handler;
