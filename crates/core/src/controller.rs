//! Per-mode turn loop.
//!
//! Every completed user utterance bumps the turn counter and dispatches one
//! background evaluation. The loop never waits on the judgment model; the
//! evaluation task hands its result to the [`TerminalStateManager`] on its own.

use crate::{
    evaluator::{EvaluationRequest, EvaluationVerdict, TurnEvaluator},
    lexical::{MarkOutcome, SessionContext, TargetLexicalItem},
    mode::{ConversationMode, ModeKind},
    notify::{NotificationGateway, ToastPayload},
    terminal::{GracePeriods, OutcomeKind, TerminalOutcome, TerminalStateManager},
};
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use tokio::{
    sync::{Mutex, mpsc},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

/// The mode-level facts a turn decision depends on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnPolicy {
    pub kind: ModeKind,
    pub phrase: String,
    pub max_turns: Option<u32>,
    pub end_on_first_success: bool,
}

impl TurnPolicy {
    pub fn for_mode(mode: &ConversationMode) -> Self {
        Self {
            kind: mode.kind(),
            phrase: mode.target_phrase().to_string(),
            max_turns: mode.max_turns(),
            end_on_first_success: mode.end_on_first_success(),
        }
    }
}

/// Sense bookkeeping after a correct explanation was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SenseProgress {
    pub sense_number: u32,
    pub explained: usize,
    pub total: usize,
}

impl SenseProgress {
    fn all_explained(&self) -> bool {
        self.explained >= self.total
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnDecision {
    Terminal(TerminalOutcome),
    /// A sense was explained but the session goes on.
    Progress(SenseProgress),
    Continue { remaining_turns: Option<u32> },
}

/// Maps one verdict to what the session should do next.
///
/// `progress` is only present in explanation mode, after a correct verdict
/// has been recorded against the sense that was evaluated.
pub fn decide(
    policy: &TurnPolicy,
    turn: u32,
    verdict: &EvaluationVerdict,
    progress: Option<SenseProgress>,
    already_succeeded: bool,
) -> TurnDecision {
    if verdict.used_correctly {
        return match (policy.kind, progress) {
            (ModeKind::Explanation, Some(progress)) => sense_explained(policy, progress),
            _ => TurnDecision::Terminal(TerminalOutcome::success(format!(
                "Excellent! You used '{}' correctly in context!",
                policy.phrase
            ))),
        };
    }

    match policy.max_turns {
        Some(max_turns) if turn >= max_turns && !already_succeeded => {
            let hint = if verdict.feedback.trim().is_empty() {
                format!(
                    "You could have said something like: 'Could you {} with your explanation?'",
                    policy.phrase
                )
            } else {
                verdict.feedback.clone()
            };
            TurnDecision::Terminal(TerminalOutcome::failure("Out of turns.", Some(hint)))
        }
        max_turns => TurnDecision::Continue {
            remaining_turns: max_turns.map(|m| m.saturating_sub(turn)),
        },
    }
}

/// Outcome of a sense newly marked as explained, whether by an evaluation or
/// by the language model's tool call.
pub fn sense_explained(policy: &TurnPolicy, progress: SenseProgress) -> TurnDecision {
    if !progress.all_explained() && !policy.end_on_first_success {
        TurnDecision::Progress(progress)
    } else if progress.all_explained() && progress.total > 1 {
        TurnDecision::Terminal(TerminalOutcome::success(format!(
            "Congratulations! You've successfully explained all {} senses of '{}'!",
            progress.total, policy.phrase
        )))
    } else {
        TurnDecision::Terminal(TerminalOutcome::success(format!(
            "Excellent! You correctly explained sense {} of '{}'!",
            progress.sense_number, policy.phrase
        )))
    }
}

/// Toast for a sense explained while the session carries on.
pub fn progress_toast(progress: &SenseProgress) -> ToastPayload {
    ToastPayload::success(format!(
        "Great job! You explained sense {} correctly!",
        progress.sense_number
    ))
}

/// What one dispatched evaluation needs once it is off the turn loop.
#[derive(Clone)]
struct TurnShared {
    policy: TurnPolicy,
    context: Arc<Mutex<SessionContext>>,
    evaluator: Arc<TurnEvaluator>,
    terminal: Arc<TerminalStateManager>,
    gateway: Arc<NotificationGateway>,
    grace: GracePeriods,
    success: Arc<AtomicBool>,
    progress_tx: Option<mpsc::Sender<TargetLexicalItem>>,
}

pub struct ConversationController {
    mode: ConversationMode,
    shared: TurnShared,
    turn_count: u32,
    in_flight: Vec<JoinHandle<()>>,
}

impl ConversationController {
    pub fn new(
        mode: ConversationMode,
        context: Arc<Mutex<SessionContext>>,
        evaluator: Arc<TurnEvaluator>,
        terminal: Arc<TerminalStateManager>,
        gateway: Arc<NotificationGateway>,
        grace: GracePeriods,
    ) -> Self {
        let policy = TurnPolicy::for_mode(&mode);
        info!(
            mode = ?policy.kind,
            phrase = %policy.phrase,
            max_turns = ?policy.max_turns,
            end_on_first_success = policy.end_on_first_success,
            "Conversation controller ready"
        );
        Self {
            mode,
            shared: TurnShared {
                policy,
                context,
                evaluator,
                terminal,
                gateway,
                grace,
                success: Arc::new(AtomicBool::new(false)),
                progress_tx: None,
            },
            turn_count: 0,
            in_flight: Vec::new(),
        }
    }

    /// Pushes the target item to `tx` whenever a sense gets explained.
    pub fn with_progress(mut self, tx: mpsc::Sender<TargetLexicalItem>) -> Self {
        self.shared.progress_tx = Some(tx);
        self
    }

    pub fn mode(&self) -> &ConversationMode {
        &self.mode
    }

    pub fn turn_count(&self) -> u32 {
        self.turn_count
    }

    pub fn succeeded(&self) -> bool {
        self.shared.success.load(Ordering::SeqCst)
    }

    /// Handles a completed user utterance and returns the turn number it was
    /// counted as, or `None` when it was ignored because the session already
    /// reached a terminal state.
    pub async fn on_user_turn_completed(&mut self, text: &str) -> Option<u32> {
        if self.shared.terminal.is_terminal() {
            debug!("Session is terminal; not evaluating further turns");
            return None;
        }
        let text = text.trim();
        if text.is_empty() {
            return None;
        }

        let (request, sense_number) = match self.build_request(text).await {
            Some(built) => built,
            None => {
                debug!("No unexplained sense left to evaluate against");
                return None;
            }
        };

        self.turn_count += 1;
        let turn = self.turn_count;
        info!(
            turn,
            max_turns = ?self.shared.policy.max_turns,
            utterance = %text,
            "User turn completed; evaluating in background"
        );

        self.in_flight.retain(|handle| !handle.is_finished());
        let shared = self.shared.clone();
        self.in_flight.push(tokio::spawn(async move {
            shared.evaluate_turn(turn, request, sense_number).await;
        }));
        Some(turn)
    }

    async fn build_request(&self, text: &str) -> Option<(EvaluationRequest, Option<u32>)> {
        match &self.mode {
            ConversationMode::RolePlay(config) => Some((
                EvaluationRequest::new(
                    text,
                    &config.target_phrase,
                    &config.target_definition,
                    &config.situation,
                )
                .with_examples(config.examples.clone())
                .with_speaker(&config.character),
                None,
            )),
            ConversationMode::Explanation(config) => {
                let ctx = self.shared.context.lock().await;
                // The context holds the live item; the config copy is its
                // initial state.
                let item = ctx.target_item.as_ref().unwrap_or(&config.target_item);
                let sense = item.next_unexplained()?;
                let scenario = format!("The learner is explaining what '{}' means", item.phrase());
                Some((
                    EvaluationRequest::new(text, item.phrase(), &sense.definition, scenario)
                        .with_examples(sense.examples.clone()),
                    Some(sense.sense_number),
                ))
            }
        }
    }

    /// Cancels every evaluation still in flight. Their results are dropped.
    pub fn shutdown(&mut self) {
        let pending = self.in_flight.len();
        for handle in self.in_flight.drain(..) {
            handle.abort();
        }
        if pending > 0 {
            info!(pending, "Cancelled in-flight evaluations");
        }
    }
}

impl Drop for ConversationController {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl TurnShared {
    async fn evaluate_turn(&self, turn: u32, request: EvaluationRequest, sense_number: Option<u32>) {
        let verdict = match self.evaluator.evaluate(&request).await {
            Ok(verdict) => verdict,
            Err(e) => {
                error!(error = %e, turn, "Evaluation could not run");
                return;
            }
        };
        info!(turn, ?verdict, "Background evaluation completed");

        if self.terminal.is_terminal() {
            debug!(turn, "Discarding evaluation result; session already terminal");
            return;
        }

        let progress = match (verdict.used_correctly, sense_number) {
            (true, Some(sense_number)) => match self.record_sense(sense_number).await {
                Some(progress) => Some(progress),
                // Counted already, most likely by a tool call during this evaluation.
                None => return,
            },
            _ => None,
        };
        let already_succeeded = self.success.load(Ordering::SeqCst);
        let decision = decide(&self.policy, turn, &verdict, progress, already_succeeded);

        match decision {
            TurnDecision::Terminal(outcome) => {
                if outcome.kind == OutcomeKind::Success {
                    self.success.store(true, Ordering::SeqCst);
                }
                let grace = self.grace.for_outcome(outcome.kind);
                self.terminal.enter_terminal(outcome, grace);
            }
            TurnDecision::Progress(progress) => {
                info!(
                    sense = progress.sense_number,
                    remaining = progress.total - progress.explained,
                    "Sense explained; session continues"
                );
                self.gateway.show_toast(&progress_toast(&progress)).await;
            }
            TurnDecision::Continue { remaining_turns } => {
                if verdict.used_target_phrase {
                    warn!(turn, ?remaining_turns, feedback = %verdict.feedback, "Incorrect usage attempt");
                } else {
                    info!(turn, ?remaining_turns, "No usage detected yet");
                }
            }
        }
    }

    async fn record_sense(&self, sense_number: u32) -> Option<SenseProgress> {
        let snapshot = {
            let mut ctx = self.context.lock().await;
            let item = ctx.target_item.as_mut()?;
            match item.mark_explained(sense_number) {
                MarkOutcome::Marked => item.clone(),
                MarkOutcome::AlreadyExplained => {
                    debug!(sense_number, "Sense was already marked explained");
                    return None;
                }
                MarkOutcome::UnknownSense => {
                    warn!(sense_number, "Evaluated sense is not part of the target item");
                    return None;
                }
            }
        };
        if let Some(tx) = &self.progress_tx {
            match tx.try_send(snapshot.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("Progress channel full; dropping progress update")
                }
                Err(mpsc::error::TrySendError::Closed(_)) => debug!("Progress receiver dropped"),
            }
        }
        Some(SenseProgress {
            sense_number,
            explained: snapshot.explained_senses(),
            total: snapshot.total_senses(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        lexical::LexicalSense,
        llm_client::MockJudgmentService,
        mode::{ExplanationConfig, ScenarioConfig},
        notify::{
            CLOSE_SESSION, SHOW_TOAST,
            testing::RecordingTransport,
        },
        terminal::TerminalState,
    };
    use serde_json::json;
    use std::time::Duration;

    const TEMPLATE: &str = "{phrase} / {definition} / {scenario} / {utterance}";

    struct Harness {
        controller: ConversationController,
        transport: Arc<RecordingTransport>,
        terminal: Arc<TerminalStateManager>,
        context: Arc<Mutex<SessionContext>>,
    }

    fn verdict_json(used: bool, correct: bool, feedback: &str) -> String {
        json!({"used_target_phrase": used, "used_correctly": correct, "feedback": feedback})
            .to_string()
    }

    fn harness(mode: ConversationMode, judge: MockJudgmentService) -> Harness {
        let transport = RecordingTransport::new();
        let gateway = Arc::new(NotificationGateway::new(transport.clone(), "student-1"));
        let terminal = TerminalStateManager::new(gateway.clone());
        let mut context = SessionContext::new("Ana");
        if let ConversationMode::Explanation(config) = &mode {
            context.install_target(config.target_item.clone());
        }
        let context = Arc::new(Mutex::new(context));
        let evaluator = Arc::new(TurnEvaluator::new(Arc::new(judge), TEMPLATE));
        let grace = mode.default_grace();
        let controller = ConversationController::new(
            mode,
            context.clone(),
            evaluator,
            terminal.clone(),
            gateway,
            grace,
        );
        Harness {
            controller,
            transport,
            terminal,
            context,
        }
    }

    async fn settle(controller: &mut ConversationController) {
        for handle in controller.in_flight.drain(..) {
            handle.await.unwrap();
        }
    }

    fn go_on(end_on_first_success: bool) -> ConversationMode {
        let item = TargetLexicalItem::new(
            "GO ON",
            vec![
                LexicalSense::new(1, "happen, take place", vec!["What's going on?".into()]),
                LexicalSense::new(2, "continue", vec!["Please go on.".into()]),
            ],
        )
        .unwrap();
        ConversationMode::Explanation(
            ExplanationConfig::new(item).with_end_on_first_success(end_on_first_success),
        )
    }

    fn pull_in(max_turns: u32) -> ConversationMode {
        ConversationMode::RolePlay(
            ScenarioConfig::new(
                "Mr. Yang",
                "a paused meeting",
                "pull in",
                "arrive at a station",
                max_turns,
            )
            .unwrap(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_explanation_success_on_first_correct_sense() {
        let mut judge = MockJudgmentService::new();
        judge
            .expect_judge()
            .withf(|_, prompt| prompt.contains("happen, take place"))
            .times(1)
            .returning(|_, _| Ok(verdict_json(true, true, "")));
        let mut h = harness(go_on(true), judge);

        let started = tokio::time::Instant::now();
        assert_eq!(
            h.controller
                .on_user_turn_completed("what's going on with the project?")
                .await,
            Some(1)
        );
        settle(&mut h.controller).await;
        assert_eq!(h.terminal.state(), TerminalState::Success);
        assert!(h.controller.succeeded());

        h.terminal.closed().await;
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert_eq!(h.transport.methods(), vec![SHOW_TOAST, CLOSE_SESSION]);
        assert_eq!(
            h.transport.recorded()[0].payload,
            json!({"type": "success", "message": "Excellent! You correctly explained sense 1 of 'GO ON'!"})
        );

        let ctx = h.context.lock().await;
        assert_eq!(ctx.target_item.as_ref().unwrap().explained_senses(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_explanation_continues_until_all_senses_when_configured() {
        let mut judge = MockJudgmentService::new();
        judge
            .expect_judge()
            .times(2)
            .returning(|_, _| Ok(verdict_json(true, true, "")));
        let (tx, mut rx) = mpsc::channel(4);
        let mut h = harness(go_on(false), judge);
        h.controller = h.controller.with_progress(tx);

        h.controller.on_user_turn_completed("it means to happen").await;
        settle(&mut h.controller).await;
        assert!(!h.terminal.is_terminal());
        assert_eq!(
            h.transport.recorded()[0].payload,
            json!({"type": "success", "message": "Great job! You explained sense 1 correctly!"})
        );
        assert_eq!(rx.recv().await.unwrap().explained_senses(), 1);

        // The second turn is judged against sense 2.
        h.controller.on_user_turn_completed("it means to continue").await;
        settle(&mut h.controller).await;
        assert_eq!(h.terminal.state(), TerminalState::Success);
        assert!(
            h.terminal
                .outcome()
                .unwrap()
                .message
                .contains("all 2 senses")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_sense_marked_during_evaluation_is_not_counted_twice() {
        let marked_elsewhere: Arc<std::sync::OnceLock<Arc<Mutex<SessionContext>>>> =
            Arc::default();
        let context_slot = marked_elsewhere.clone();
        let mut judge = MockJudgmentService::new();
        judge.expect_judge().times(1).returning(move |_, _| {
            // The model's tool call lands while the judgment is pending.
            let context = context_slot.get().unwrap();
            let outcome = context
                .try_lock()
                .unwrap()
                .target_item
                .as_mut()
                .unwrap()
                .mark_explained(1);
            assert_eq!(outcome, MarkOutcome::Marked);
            Ok(verdict_json(true, true, ""))
        });
        let (tx, mut rx) = mpsc::channel(4);
        let mut h = harness(go_on(false), judge);
        h.controller = h.controller.with_progress(tx);
        marked_elsewhere.set(h.context.clone()).unwrap();

        h.controller.on_user_turn_completed("it means to happen").await;
        settle(&mut h.controller).await;

        assert!(!h.terminal.is_terminal());
        assert!(h.transport.recorded().is_empty());
        assert!(rx.try_recv().is_err());
        let ctx = h.context.lock().await;
        assert_eq!(ctx.target_item.as_ref().unwrap().explained_senses(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_role_play_fails_after_max_turns_with_last_feedback() {
        let mut judge = MockJudgmentService::new();
        let mut call = 0;
        judge.expect_judge().times(3).returning(move |_, _| {
            call += 1;
            Ok(verdict_json(false, false, &format!("feedback {call}")))
        });
        let mut h = harness(pull_in(3), judge);

        for text in ["Hello there.", "Shall we continue?", "The train is late."] {
            h.controller.on_user_turn_completed(text).await;
            settle(&mut h.controller).await;
        }

        assert_eq!(h.terminal.state(), TerminalState::Failure);
        let outcome = h.terminal.outcome().unwrap();
        assert_eq!(outcome.hint.as_deref(), Some("feedback 3"));

        h.terminal.closed().await;
        assert_eq!(
            h.transport.recorded()[0].payload,
            json!({"type": "error", "message": "Out of turns.", "hint": "feedback 3"})
        );
        assert_eq!(h.transport.recorded()[1].payload["state_type"], json!("failure"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_role_play_failure_fires_exactly_at_turn_limit() {
        let mut judge = MockJudgmentService::new();
        judge
            .expect_judge()
            .returning(|_, _| Ok(verdict_json(false, false, "Use 'pull in'.")));
        let mut h = harness(pull_in(5), judge);

        for turn in 1..=4 {
            h.controller
                .on_user_turn_completed(&format!("turn {turn}"))
                .await;
            settle(&mut h.controller).await;
            assert!(!h.terminal.is_terminal(), "terminal too early at turn {turn}");
        }
        assert_eq!(h.controller.on_user_turn_completed("turn 5").await, Some(5));
        settle(&mut h.controller).await;
        assert_eq!(h.terminal.state(), TerminalState::Failure);
    }

    #[tokio::test(start_paused = true)]
    async fn test_role_play_success_uses_role_play_grace() {
        let mut judge = MockJudgmentService::new();
        judge
            .expect_judge()
            .returning(|_, _| Ok(verdict_json(true, true, "")));
        let mut h = harness(pull_in(5), judge);

        h.controller
            .on_user_turn_completed("The train should pull in any minute.")
            .await;
        settle(&mut h.controller).await;

        let started = tokio::time::Instant::now();
        h.terminal.closed().await;
        assert!(started.elapsed() >= Duration::from_secs(4));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(
            h.terminal.outcome().unwrap().message,
            "Excellent! You used 'pull in' correctly in context!"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_turns_after_terminal_are_not_evaluated() {
        let mut judge = MockJudgmentService::new();
        judge.expect_judge().never();
        let mut h = harness(pull_in(3), judge);

        h.terminal
            .enter_terminal(TerminalOutcome::failure("Out of turns.", None), Duration::ZERO);
        assert_eq!(h.controller.on_user_turn_completed("hello").await, None);
        assert_eq!(h.controller.turn_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_result_is_discarded_after_terminal() {
        let mut judge = MockJudgmentService::new();
        judge
            .expect_judge()
            .times(1)
            .returning(|_, _| Ok(verdict_json(true, true, "")));
        let mut h = harness(pull_in(3), judge);

        h.controller.on_user_turn_completed("pull in").await;
        // Another path wins before the spawned evaluation gets to run.
        h.terminal.enter_terminal(
            TerminalOutcome::failure("Ended elsewhere", None),
            Duration::from_secs(1),
        );
        settle(&mut h.controller).await;
        h.terminal.closed().await;

        assert_eq!(h.terminal.outcome().unwrap().kind, OutcomeKind::Failure);
        assert_eq!(h.transport.count(SHOW_TOAST), 1);
        assert!(!h.controller.succeeded());
    }

    #[test]
    fn test_decide_continue_reports_remaining_turns() {
        let policy = TurnPolicy::for_mode(&pull_in(5));
        let verdict = EvaluationVerdict {
            used_target_phrase: true,
            used_correctly: false,
            feedback: "Wrong sense.".into(),
        };
        assert_eq!(
            decide(&policy, 2, &verdict, None, false),
            TurnDecision::Continue {
                remaining_turns: Some(3)
            }
        );
        // A session that already succeeded never turns into a failure.
        assert!(matches!(
            decide(&policy, 5, &verdict, None, true),
            TurnDecision::Continue { .. }
        ));
    }

    #[test]
    fn test_decide_failure_falls_back_to_generic_hint() {
        let policy = TurnPolicy::for_mode(&pull_in(1));
        let verdict = EvaluationVerdict {
            used_target_phrase: false,
            used_correctly: false,
            feedback: String::new(),
        };
        let TurnDecision::Terminal(outcome) = decide(&policy, 1, &verdict, None, false) else {
            panic!("expected terminal");
        };
        assert!(outcome.hint.unwrap().contains("pull in"));
    }
}
