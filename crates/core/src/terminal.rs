//! Terminal State Machine
//!
//! A session reaches at most one terminal outcome. The first caller of
//! [`TerminalStateManager::enter_terminal`] wins; every later call is a no-op.
//! Winning schedules a single background sequence: toast now, then
//! `close_session` once the grace period has let in-flight speech finish.
//!
//! ```text
//! Active -> Success | Failure -> Closing -> Closed
//! ```

use crate::notify::{NotificationGateway, ToastPayload};
use serde::{Deserialize, Serialize};
use std::{
    sync::{Arc, Mutex, OnceLock, PoisonError},
    time::Duration,
};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeKind {
    Success,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalOutcome {
    pub kind: OutcomeKind,
    pub message: String,
    pub hint: Option<String>,
}

impl TerminalOutcome {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            kind: OutcomeKind::Success,
            message: message.into(),
            hint: None,
        }
    }

    pub fn failure(message: impl Into<String>, hint: Option<String>) -> Self {
        Self {
            kind: OutcomeKind::Failure,
            message: message.into(),
            hint,
        }
    }

    /// Hints are only shown to the learner for failures.
    fn toast(&self) -> ToastPayload {
        match self.kind {
            OutcomeKind::Success => ToastPayload::success(self.message.clone()),
            OutcomeKind::Failure => ToastPayload::error(self.message.clone(), self.hint.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalState {
    Active,
    Success,
    Failure,
    Closing,
    Closed,
}

impl TerminalState {
    fn entered(kind: OutcomeKind) -> Self {
        match kind {
            OutcomeKind::Success => Self::Success,
            OutcomeKind::Failure => Self::Failure,
        }
    }
}

/// Grace periods between deciding an outcome and instructing closure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GracePeriods {
    pub success: Duration,
    pub failure: Duration,
}

impl GracePeriods {
    /// Explanation mode ends on a single answer; give the tutor time to react.
    pub fn explanation() -> Self {
        Self {
            success: Duration::from_secs(5),
            failure: Duration::from_secs(5),
        }
    }

    pub fn role_play() -> Self {
        Self {
            success: Duration::from_secs(4),
            failure: Duration::from_secs(3),
        }
    }

    pub fn for_outcome(&self, kind: OutcomeKind) -> Duration {
        match kind {
            OutcomeKind::Success => self.success,
            OutcomeKind::Failure => self.failure,
        }
    }
}

pub struct TerminalStateManager {
    state: watch::Sender<TerminalState>,
    outcome: OnceLock<TerminalOutcome>,
    gateway: Arc<NotificationGateway>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TerminalStateManager {
    pub fn new(gateway: Arc<NotificationGateway>) -> Arc<Self> {
        let (state, _) = watch::channel(TerminalState::Active);
        Arc::new(Self {
            state,
            outcome: OnceLock::new(),
            gateway,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn state(&self) -> TerminalState {
        *self.state.borrow()
    }

    /// True once any outcome has been entered, including after closure.
    pub fn is_terminal(&self) -> bool {
        self.state() != TerminalState::Active
    }

    pub fn outcome(&self) -> Option<&TerminalOutcome> {
        self.outcome.get()
    }

    /// Records `outcome` if the session is still active and schedules the
    /// notify-then-close sequence. Returns whether this call won.
    ///
    /// Never blocks on the peer. Must be called from within a tokio runtime.
    pub fn enter_terminal(self: &Arc<Self>, outcome: TerminalOutcome, grace: Duration) -> bool {
        let target = TerminalState::entered(outcome.kind);
        // Check-and-set happens under the channel's write lock.
        let won = self.state.send_if_modified(|state| {
            if *state == TerminalState::Active {
                *state = target;
                true
            } else {
                false
            }
        });
        if !won {
            debug!(
                attempted = ?outcome.kind,
                current = ?self.state(),
                "Ignoring duplicate terminal transition"
            );
            return false;
        }

        info!(kind = ?outcome.kind, message = %outcome.message, ?grace, "Entering terminal state");
        let _ = self.outcome.set(outcome.clone());

        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            this.gateway.show_toast(&outcome.toast()).await;

            info!(?grace, "Waiting before closing session to let the agent finish speaking");
            tokio::time::sleep(grace).await;

            this.state.send_replace(TerminalState::Closing);
            this.gateway.close_session(outcome.kind).await;
            // Closed whether or not the peer acknowledged.
            this.state.send_replace(TerminalState::Closed);
        });
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
        true
    }

    /// Resolves once the closure instruction has been attempted.
    pub async fn closed(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|state| *state == TerminalState::Closed).await;
    }

    /// Aborts any pending notify/close sequence and marks the session closed.
    /// Used on teardown; no instruction is sent after this returns.
    pub fn shutdown(&self) {
        let handles: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in handles {
            handle.abort();
        }
        self.state.send_replace(TerminalState::Closed);
    }
}
