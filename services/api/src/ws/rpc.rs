//! Request/response RPCs to the client, carried over the session's WebSocket.
//!
//! An outbound call is written as an `rpc` frame and parked in
//! [`PendingRpcs`] until the socket reader sees the matching `rpc_response`.

use super::{protocol::ServerMessage, session::{WsSink, send_msg}};
use anyhow::{Context, anyhow};
use async_trait::async_trait;
use lexis_core::notify::PeerTransport;
use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio::sync::oneshot;
use tracing::debug;

type RpcResult = Result<String, String>;

/// Outstanding RPCs of one connection, keyed by request id.
#[derive(Default)]
pub struct PendingRpcs {
    next_id: AtomicU64,
    waiting: Mutex<HashMap<u64, oneshot::Sender<RpcResult>>>,
}

impl PendingRpcs {
    fn register(&self) -> (u64, oneshot::Receiver<RpcResult>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        self.waiting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, tx);
        (id, rx)
    }

    /// Hands a client response to its waiting caller. Returns `false` when
    /// nobody is waiting any more, e.g. the call already timed out.
    pub fn complete(&self, id: u64, result: RpcResult) -> bool {
        let waiter = self
            .waiting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        match waiter {
            Some(tx) => tx.send(result).is_ok(),
            None => false,
        }
    }

    fn forget(&self, id: u64) {
        self.waiting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }

    pub fn len(&self) -> usize {
        self.waiting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct WsPeerTransport {
    sink: WsSink,
    pending: Arc<PendingRpcs>,
}

impl WsPeerTransport {
    pub fn new(sink: WsSink, pending: Arc<PendingRpcs>) -> Self {
        Self { sink, pending }
    }
}

#[async_trait]
impl PeerTransport for WsPeerTransport {
    async fn perform_rpc(
        &self,
        destination: &str,
        method: &str,
        payload: String,
        response_timeout: Duration,
    ) -> anyhow::Result<String> {
        let (id, rx) = self.pending.register();
        debug!(id, %destination, %method, "Sending RPC to client");

        let frame = ServerMessage::Rpc {
            id,
            method: method.to_string(),
            payload,
        };
        if let Err(e) = send_msg(&mut *self.sink.lock().await, frame).await {
            self.pending.forget(id);
            return Err(e).context(format!("Failed to write '{method}' RPC frame"));
        }

        let outcome = tokio::time::timeout(response_timeout, rx).await;
        self.pending.forget(id);
        match outcome {
            Ok(Ok(Ok(body))) => Ok(body),
            Ok(Ok(Err(reason))) => Err(anyhow!("{destination} rejected '{method}': {reason}")),
            Ok(Err(_)) => Err(anyhow!("Connection closed before '{method}' was acknowledged")),
            Err(_) => Err(anyhow!(
                "'{method}' was not acknowledged within {response_timeout:?}"
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_complete_wakes_waiter() {
        let pending = PendingRpcs::default();
        let (id, rx) = pending.register();

        assert!(pending.complete(id, Ok("ok".into())));
        assert_eq!(rx.await.unwrap(), Ok("ok".to_string()));
        assert!(pending.is_empty());
    }

    #[test]
    fn test_ids_are_unique() {
        let pending = PendingRpcs::default();
        let (a, _rx_a) = pending.register();
        let (b, _rx_b) = pending.register();
        assert_ne!(a, b);
        assert_eq!(pending.len(), 2);
    }

    #[test]
    fn test_late_or_unknown_response_is_dropped() {
        let pending = PendingRpcs::default();
        let (id, rx) = pending.register();
        pending.forget(id);

        assert!(!pending.complete(id, Ok("late".into())));
        assert!(!pending.complete(999, Err("nobody".into())));
        drop(rx);
    }

    #[test]
    fn test_complete_after_caller_gave_up() {
        let pending = PendingRpcs::default();
        let (id, rx) = pending.register();
        drop(rx);
        assert!(!pending.complete(id, Ok("ok".into())));
    }
}
