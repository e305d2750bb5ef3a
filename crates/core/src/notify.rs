//! Best-effort notifications to the single remote peer of a session.
//!
//! Every RPC is bounded by a short timeout and is never retried: a late
//! instruction is worse for the client UI than a missing one.

use crate::{error::NotificationError, terminal::OutcomeKind};
use async_trait::async_trait;
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use tracing::{info, warn};

pub const SHOW_TOAST: &str = "show_toast";
pub const CLOSE_SESSION: &str = "close_session";
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(1);

/// Delivers a request/response RPC to a peer. Implemented by whatever
/// connection the session runs over.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn perform_rpc(
        &self,
        destination: &str,
        method: &str,
        payload: String,
        response_timeout: Duration,
    ) -> anyhow::Result<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ToastKind {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToastPayload {
    #[serde(rename = "type")]
    pub kind: ToastKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl ToastPayload {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            kind: ToastKind::Success,
            message: message.into(),
            hint: None,
        }
    }

    pub fn error(message: impl Into<String>, hint: Option<String>) -> Self {
        Self {
            kind: ToastKind::Error,
            message: message.into(),
            hint: hint.filter(|h| !h.is_empty()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CloseSessionPayload {
    pub action: &'static str,
    pub reason: &'static str,
    pub state_type: OutcomeKind,
}

impl CloseSessionPayload {
    pub fn terminal(state_type: OutcomeKind) -> Self {
        Self {
            action: "close_session",
            reason: "terminal_state_reached",
            state_type,
        }
    }
}

pub struct NotificationGateway {
    transport: Arc<dyn PeerTransport>,
    peer: String,
    timeout: Duration,
}

impl NotificationGateway {
    pub fn new(transport: Arc<dyn PeerTransport>, peer: impl Into<String>) -> Self {
        Self {
            transport,
            peer: peer.into(),
            timeout: DEFAULT_RPC_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Sends a toast. Returns whether the peer acknowledged it; failures are
    /// logged and swallowed.
    pub async fn show_toast(&self, toast: &ToastPayload) -> bool {
        match self.send(SHOW_TOAST, toast).await {
            Ok(()) => {
                info!(peer = %self.peer, kind = ?toast.kind, "Sent toast");
                true
            }
            Err(e) => {
                warn!(error = %e, "Failed to send toast notification");
                false
            }
        }
    }

    /// Instructs the peer to close the session. Same delivery rules as
    /// [`Self::show_toast`].
    pub async fn close_session(&self, state_type: OutcomeKind) -> bool {
        match self
            .send(CLOSE_SESSION, &CloseSessionPayload::terminal(state_type))
            .await
        {
            Ok(()) => {
                info!(peer = %self.peer, ?state_type, "Sent session closure instruction");
                true
            }
            Err(e) => {
                warn!(error = %e, "Failed to send session closure instruction");
                false
            }
        }
    }

    async fn send(
        &self,
        method: &'static str,
        payload: &impl Serialize,
    ) -> Result<(), NotificationError> {
        let payload = serde_json::to_string(payload)
            .map_err(|source| NotificationError::Encode { method, source })?;

        // The transport is handed the timeout too, but a misbehaving one must
        // not be able to hold the caller past it.
        let call = self
            .transport
            .perform_rpc(&self.peer, method, payload, self.timeout);
        match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(source)) => Err(NotificationError::Delivery {
                method,
                destination: self.peer.clone(),
                source,
            }),
            Err(_) => Err(NotificationError::Timeout {
                method,
                destination: self.peer.clone(),
                timeout: self.timeout,
            }),
        }
    }
}
