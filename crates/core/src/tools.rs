//! Explanation-mode tool surface
//!
//! The tools the conversational model may call while the learner explains the
//! target phrase, served over the Model Context Protocol (MCP). Marking is
//! idempotent; every state change is pushed to an optional progress channel
//! and terminal outcomes go through the shared [`TerminalStateManager`].

use crate::{
    controller::{SenseProgress, TurnDecision, TurnPolicy, progress_toast, sense_explained},
    lexical::{MarkOutcome, SessionContext, TargetLexicalItem},
    notify::NotificationGateway,
    terminal::{GracePeriods, TerminalOutcome, TerminalStateManager},
};
use rmcp::{
    ServerHandler,
    handler::server::{router::tool::ToolRouter, tool::Parameters},
    model::{ServerCapabilities, ServerInfo},
    tool, tool_handler, tool_router,
};
use schemars::JsonSchema;
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

/// Longest definition excerpt shown in a failure toast.
const TOAST_DEFINITION_CHARS: usize = 100;

const SESSION_ENDED: &str = "The session has already ended; no further changes were made.";

#[derive(Deserialize, JsonSchema, Debug)]
pub struct MarkSenseCorrectArgs {
    /// The sense number that was correctly explained (1, 2, 3, ...).
    pub sense_number: u32,
}

#[derive(Deserialize, JsonSchema, Debug)]
pub struct MarkWrongArgs {
    #[schemars(description = "The correct definition to share with the learner")]
    pub correct_definition: String,
    #[schemars(description = "Optional extra hint or example to help the learner")]
    #[serde(default)]
    pub helpful_hint: Option<String>,
}

#[derive(Deserialize, JsonSchema, Debug)]
pub struct RequestClarificationArgs {
    /// The sense number the learner is trying to explain.
    pub sense_number: u32,
    #[schemars(description = "A specific question that helps the learner clarify")]
    pub clarifying_question: String,
}

pub struct ExplanationTools {
    policy: TurnPolicy,
    context: Arc<Mutex<SessionContext>>,
    terminal: Arc<TerminalStateManager>,
    gateway: Arc<NotificationGateway>,
    grace: GracePeriods,
    state_tx: Option<mpsc::Sender<TargetLexicalItem>>,
    tool_router: ToolRouter<Self>,
}

#[tool_handler]
impl ServerHandler for ExplanationTools {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}

#[tool_router]
impl ExplanationTools {
    pub fn new(
        policy: TurnPolicy,
        context: Arc<Mutex<SessionContext>>,
        terminal: Arc<TerminalStateManager>,
        gateway: Arc<NotificationGateway>,
        grace: GracePeriods,
        state_tx: Option<mpsc::Sender<TargetLexicalItem>>,
    ) -> Self {
        Self {
            policy,
            context,
            terminal,
            gateway,
            grace,
            state_tx,
            tool_router: Self::tool_router(),
        }
    }

    #[tool(
        description = "Get the target phrasal verb with every sense and whether it has been explained yet."
    )]
    pub async fn get_session_status(&self) -> Result<String, String> {
        info!("Executing tool 'get_session_status'");
        let ctx = self.context.lock().await;
        let item = ctx
            .target_item
            .as_ref()
            .ok_or_else(|| "No target phrasal verb is loaded for this session.".to_string())?;
        serde_json::to_string(item).map_err(|e| format!("Failed to serialize session status: {e}"))
    }

    /// Records a correctly explained sense and applies the session's
    /// end-on-first-success policy.
    #[tool(
        description = "REQUIRED: call immediately when the learner correctly explains any sense of the target phrasal verb, even if imperfectly worded."
    )]
    pub async fn mark_sense_correct(
        &self,
        args: Parameters<MarkSenseCorrectArgs>,
    ) -> Result<String, String> {
        let sense_number = args.0.sense_number;
        info!(sense_number, "Executing tool 'mark_sense_correct'");
        if self.session_ended() {
            return Ok(SESSION_ENDED.to_string());
        }

        let snapshot = {
            let mut ctx = self.context.lock().await;
            let item = ctx
                .target_item
                .as_mut()
                .ok_or_else(|| "No target phrasal verb is loaded for this session.".to_string())?;
            // Re-checked under the lock; another tool may have ended the session.
            if self.terminal.is_terminal() {
                return Ok(SESSION_ENDED.to_string());
            }
            match item.mark_explained(sense_number) {
                MarkOutcome::UnknownSense => {
                    return Err(format!(
                        "Sense {sense_number} does not exist; '{}' has {} senses.",
                        item.phrase(),
                        item.total_senses()
                    ));
                }
                MarkOutcome::AlreadyExplained => {
                    return Ok(format!("Sense {sense_number} was already marked as explained."));
                }
                MarkOutcome::Marked => item.clone(),
            }
        };
        self.broadcast(&snapshot);

        let progress = SenseProgress {
            sense_number,
            explained: snapshot.explained_senses(),
            total: snapshot.total_senses(),
        };
        match sense_explained(&self.policy, progress) {
            TurnDecision::Terminal(outcome) => {
                let grace = self.grace.for_outcome(outcome.kind);
                self.terminal.enter_terminal(outcome, grace);
            }
            TurnDecision::Progress(progress) => {
                self.gateway.show_toast(&progress_toast(&progress)).await;
            }
            TurnDecision::Continue { .. } => {}
        }

        Ok(format!(
            "Excellent! The learner correctly explained sense {sense_number}. {} of {} senses remain.",
            snapshot.remaining_senses(),
            snapshot.total_senses()
        ))
    }

    #[tool(
        description = "ONLY call for an explanation that shows no understanding of any sense. Ends the session."
    )]
    pub async fn mark_wrong(&self, args: Parameters<MarkWrongArgs>) -> Result<String, String> {
        let MarkWrongArgs {
            correct_definition,
            helpful_hint,
        } = args.0;
        info!("Executing tool 'mark_wrong'");
        if self.session_ended() {
            return Ok(SESSION_ENDED.to_string());
        }

        let excerpt: String = correct_definition
            .chars()
            .take(TOAST_DEFINITION_CHARS)
            .collect();
        let outcome = TerminalOutcome::failure(
            format!("Not quite right. The correct meaning is: {excerpt}..."),
            Some("Keep practicing! You'll master this phrasal verb.".to_string()),
        );
        let grace = self.grace.for_outcome(outcome.kind);
        self.terminal.enter_terminal(outcome, grace);

        let mut response = format!("Not quite right. The correct definition is: {correct_definition}");
        if let Some(hint) = helpful_hint.filter(|h| !h.trim().is_empty()) {
            response.push(' ');
            response.push_str(&hint);
        }
        response.push_str(" Keep practicing and you'll get it next time!");
        Ok(response)
    }

    #[tool(
        description = "Call when the learner's explanation is unclear and you need them to elaborate before judging it."
    )]
    pub async fn request_clarification(
        &self,
        args: Parameters<RequestClarificationArgs>,
    ) -> Result<String, String> {
        let RequestClarificationArgs {
            sense_number,
            clarifying_question,
        } = args.0;
        info!(sense_number, "Executing tool 'request_clarification'");

        let ctx = self.context.lock().await;
        if let Some(item) = &ctx.target_item {
            if item.sense(sense_number).is_none() {
                return Err(format!("Sense {sense_number} does not exist."));
            }
        }
        Ok(format!(
            "I want to make sure I understand your explanation correctly. {clarifying_question}"
        ))
    }

    #[tool(
        description = "Call once the learner has correctly explained ALL senses of the target phrasal verb. Ends the session."
    )]
    pub async fn mark_all_senses_complete(&self) -> Result<String, String> {
        info!("Executing tool 'mark_all_senses_complete'");
        if self.session_ended() {
            return Ok(SESSION_ENDED.to_string());
        }
        let (name, phrase, total, remaining) = {
            let ctx = self.context.lock().await;
            match &ctx.target_item {
                Some(item) => (
                    ctx.participant_name.clone(),
                    item.phrase().to_string(),
                    item.total_senses(),
                    item.remaining_senses(),
                ),
                None => (
                    ctx.participant_name.clone(),
                    self.policy.phrase.clone(),
                    0,
                    0,
                ),
            }
        };
        if remaining > 0 {
            warn!(remaining, "Completion requested with senses still unexplained");
        }

        let outcome = TerminalOutcome::success(format!(
            "Congratulations! You've successfully explained all {total} senses of '{phrase}'!"
        ));
        let grace = self.grace.for_outcome(outcome.kind);
        self.terminal.enter_terminal(outcome, grace);

        Ok(format!(
            "Congratulations {name}! You've explained all {total} senses of '{phrase}'. Great work on expanding your vocabulary!"
        ))
    }
}

impl ExplanationTools {
    fn session_ended(&self) -> bool {
        let ended = self.terminal.is_terminal();
        if ended {
            debug!(state = ?self.terminal.state(), "Ignoring tool call; session is terminal");
        }
        ended
    }

    /// Never waits: the receiver is drained by the same loop that runs tools.
    fn broadcast(&self, item: &TargetLexicalItem) {
        if let Some(tx) = &self.state_tx {
            match tx.try_send(item.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("Progress channel full; dropping progress update")
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    warn!("Failed to broadcast progress update: receiver dropped.")
                }
            }
        }
    }
}
