//! Shared Application State
//!
//! This module defines the `AppState` struct, which holds the shared,
//! clonable resources every session draws on.

use crate::config::Config;
use lexis_core::{
    llm_client::{JudgmentService, LLMClient},
    mode::ModeKind,
    prompts::PromptTemplates,
    routing::RetryPolicy,
    terminal::GracePeriods,
};
use std::sync::Arc;

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub llm_client: Arc<dyn LLMClient>,
    pub judge: Arc<dyn JudgmentService>,
    pub prompts: Arc<PromptTemplates>,
    pub config: Arc<Config>,
}

impl AppState {
    /// Grace periods for a mode, as configured.
    pub fn grace_periods(&self, kind: ModeKind) -> GracePeriods {
        match kind {
            ModeKind::Explanation => GracePeriods {
                success: self.config.explanation_grace,
                failure: self.config.explanation_grace,
            },
            ModeKind::RolePlay => GracePeriods {
                success: self.config.role_play_success_grace,
                failure: self.config.role_play_failure_grace,
            },
        }
    }

    pub fn metadata_retry(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.config.metadata_max_attempts,
            self.config.metadata_retry_base,
        )
    }
}
