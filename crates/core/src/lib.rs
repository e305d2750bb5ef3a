//! Session-control core for spoken phrasal-verb practice.
//!
//! Resolves a participant's practice mode, evaluates each completed turn in
//! the background and closes the session exactly once when an outcome is
//! reached. Network servers and provider wiring live in the `lexis-api`
//! service; this crate talks to them only through the [`llm_client`] and
//! [`notify::PeerTransport`] traits.

pub mod cache;
pub mod controller;
pub mod error;
pub mod evaluator;
pub mod lexical;
pub mod llm_client;
pub mod metadata;
pub mod mode;
pub mod notify;
pub mod prompts;
pub mod routing;
pub mod terminal;
pub mod tools;
