//! Turn Evaluation
//!
//! Judges a single learner utterance against exactly one sense of the target
//! phrase. Results are memoized per session so that a repeated utterance never
//! costs a second call to the judgment model.

use crate::{
    cache::{CacheKey, EvaluationCache},
    error::{EvaluationError, JudgmentParseError},
    llm_client::JudgmentService,
    prompts::render,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};

/// At most this many usage examples are shown to the judgment model.
pub const MAX_PROMPT_EXAMPLES: usize = 3;

const JUDGE_SYSTEM_PROMPT: &str =
    "You are a language learning evaluator. Return only valid JSON.";

/// The structured result of judging one utterance against one sense.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationVerdict {
    #[serde(default, alias = "usedTargetPhrase", alias = "used_verb")]
    pub used_target_phrase: bool,
    #[serde(default, alias = "usedCorrectly")]
    pub used_correctly: bool,
    #[serde(default)]
    pub feedback: String,
}

impl EvaluationVerdict {
    /// The "please try again" verdict returned when the judgment model cannot
    /// be reached or understood.
    pub fn conservative(phrase: &str) -> Self {
        Self {
            used_target_phrase: false,
            used_correctly: false,
            feedback: format!("Try using '{phrase}' naturally in your response."),
        }
    }
}

/// Everything the evaluator needs to judge one utterance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvaluationRequest {
    pub utterance: String,
    pub target_phrase: String,
    pub target_definition: String,
    pub scenario: String,
    pub examples: Vec<String>,
    pub speaker: Option<String>,
}

impl EvaluationRequest {
    pub fn new(
        utterance: impl Into<String>,
        target_phrase: impl Into<String>,
        target_definition: impl Into<String>,
        scenario: impl Into<String>,
    ) -> Self {
        Self {
            utterance: utterance.into(),
            target_phrase: target_phrase.into(),
            target_definition: target_definition.into(),
            scenario: scenario.into(),
            examples: Vec::new(),
            speaker: None,
        }
    }

    pub fn with_examples(mut self, examples: Vec<String>) -> Self {
        self.examples = examples;
        self
    }

    pub fn with_speaker(mut self, speaker: impl Into<String>) -> Self {
        self.speaker = Some(speaker.into());
        self
    }

    fn cache_key(&self) -> CacheKey {
        CacheKey {
            utterance: self.utterance.clone(),
            phrase: self.target_phrase.clone(),
            definition: self.target_definition.clone(),
            scenario: self.scenario.clone(),
        }
    }
}

pub struct TurnEvaluator {
    judge: Arc<dyn JudgmentService>,
    cache: EvaluationCache,
    prompt_template: String,
    translation_language: Option<String>,
}

impl TurnEvaluator {
    /// Creates an evaluator with an empty cache.
    ///
    /// `prompt_template` understands the placeholders `{phrase}`,
    /// `{definition}`, `{scenario}`, `{utterance}`, `{speaker_line}`,
    /// `{examples}` and `{translation_line}`.
    pub fn new(judge: Arc<dyn JudgmentService>, prompt_template: impl Into<String>) -> Self {
        Self {
            judge,
            cache: EvaluationCache::new(),
            prompt_template: prompt_template.into(),
            translation_language: None,
        }
    }

    /// Also accepts an explanation given in `language` as correct.
    pub fn with_translation_language(mut self, language: Option<String>) -> Self {
        self.translation_language = language.filter(|l| !l.trim().is_empty());
        self
    }

    pub fn cache(&self) -> &EvaluationCache {
        &self.cache
    }

    /// Judges `request.utterance` against `request.target_definition` only.
    ///
    /// Fails solely when the definition is empty. Any trouble with the
    /// judgment model yields [`EvaluationVerdict::conservative`] instead.
    pub async fn evaluate(
        &self,
        request: &EvaluationRequest,
    ) -> Result<EvaluationVerdict, EvaluationError> {
        if request.target_definition.trim().is_empty() {
            return Err(EvaluationError::MissingDefinition {
                phrase: request.target_phrase.clone(),
            });
        }

        let key = request.cache_key();
        if let Some(cached) = self.cache.get(&key).await {
            info!(
                phrase = %request.target_phrase,
                definition = %request.target_definition,
                "Using cached evaluation"
            );
            return Ok(cached);
        }

        let prompt = self.build_prompt(request);
        let raw = match self.judge.judge(JUDGE_SYSTEM_PROMPT, &prompt).await {
            Ok(raw) => raw,
            Err(e) => {
                error!(error = ?e, phrase = %request.target_phrase, "Judgment request failed");
                return Ok(EvaluationVerdict::conservative(&request.target_phrase));
            }
        };
        info!(response = %raw, "Evaluation response");

        match parse_verdict(&raw) {
            Ok(verdict) => {
                self.cache.insert(key, verdict.clone()).await;
                info!(phrase = %request.target_phrase, ?verdict, "Evaluation complete");
                Ok(verdict)
            }
            Err(e) => {
                warn!(error = %e, response = %raw, "Failed to parse judgment response");
                Ok(EvaluationVerdict::conservative(&request.target_phrase))
            }
        }
    }

    pub fn build_prompt(&self, request: &EvaluationRequest) -> String {
        let examples = if request.examples.is_empty() {
            String::new()
        } else {
            let lines: Vec<String> = request
                .examples
                .iter()
                .take(MAX_PROMPT_EXAMPLES)
                .map(|example| format!("- {example}"))
                .collect();
            format!("Examples of correct usage:\n{}", lines.join("\n"))
        };
        let speaker_line = request
            .speaker
            .as_deref()
            .map(|speaker| format!("Character context: Speaking with {speaker}"))
            .unwrap_or_default();
        let translation_line = self
            .translation_language
            .as_deref()
            .map(|language| {
                format!(
                    "An explanation or translation given in {language} that matches the meaning counts as correct usage."
                )
            })
            .unwrap_or_default();

        render(
            &self.prompt_template,
            &[
                ("phrase", &request.target_phrase),
                ("definition", &request.target_definition),
                ("scenario", &request.scenario),
                ("utterance", &request.utterance),
                ("speaker_line", &speaker_line),
                ("examples", &examples),
                ("translation_line", &translation_line),
            ],
        )
    }
}

/// Parses the judgment model's output, tolerating a Markdown code fence.
fn parse_verdict(raw: &str) -> Result<EvaluationVerdict, JudgmentParseError> {
    let trimmed = raw.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.trim_end().strip_suffix("```"))
        .unwrap_or(trimmed);
    Ok(serde_json::from_str(body.trim())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm_client::MockJudgmentService;
    use anyhow::anyhow;

    const TEMPLATE: &str = "Phrase: {phrase}\nMeaning: {definition}\nScenario: {scenario}\n{speaker_line}\nStudent said: \"{utterance}\"\n{examples}\n{translation_line}";

    fn request(utterance: &str) -> EvaluationRequest {
        EvaluationRequest::new(utterance, "go on", "happen, take place", "a project check-in")
    }

    fn evaluator(mock: MockJudgmentService) -> TurnEvaluator {
        TurnEvaluator::new(Arc::new(mock), TEMPLATE)
    }

    #[tokio::test]
    async fn test_second_identical_call_hits_cache() {
        let mut mock = MockJudgmentService::new();
        mock.expect_judge().times(1).returning(|_, _| {
            Ok(r#"{"used_target_phrase": true, "used_correctly": true, "feedback": ""}"#.into())
        });
        let evaluator = evaluator(mock);

        let first = evaluator
            .evaluate(&request("what's going on with the project?"))
            .await
            .unwrap();
        let second = evaluator
            .evaluate(&request("what's going on with the project?"))
            .await
            .unwrap();

        assert!(first.used_correctly);
        assert_eq!(first, second);
        assert_eq!(evaluator.cache().len().await, 1);
    }

    #[tokio::test]
    async fn test_examples_and_speaker_do_not_affect_cache_key() {
        let mut mock = MockJudgmentService::new();
        mock.expect_judge()
            .times(1)
            .returning(|_, _| Ok(r#"{"used_target_phrase": false, "used_correctly": false, "feedback": "Use it."}"#.into()));
        let evaluator = evaluator(mock);

        evaluator.evaluate(&request("hello")).await.unwrap();
        let again = request("hello")
            .with_examples(vec!["What's going on?".into()])
            .with_speaker("Mr. Yang");
        let verdict = evaluator.evaluate(&again).await.unwrap();
        assert_eq!(verdict.feedback, "Use it.");
    }

    #[tokio::test]
    async fn test_missing_definition_fails_without_call_or_cache_write() {
        let mut mock = MockJudgmentService::new();
        mock.expect_judge().never();
        let evaluator = evaluator(mock);

        let req = EvaluationRequest::new("what's going on?", "go on", "  ", "a meeting");
        let err = evaluator.evaluate(&req).await.unwrap_err();

        assert!(matches!(err, EvaluationError::MissingDefinition { ref phrase } if phrase == "go on"));
        assert!(evaluator.cache().is_empty().await);
    }

    #[tokio::test]
    async fn test_malformed_output_returns_conservative_verdict_uncached() {
        let mut mock = MockJudgmentService::new();
        mock.expect_judge()
            .times(2)
            .returning(|_, _| Ok("I think they did great!".into()));
        let evaluator = evaluator(mock);

        let verdict = evaluator.evaluate(&request("go on")).await.unwrap();
        assert_eq!(verdict, EvaluationVerdict::conservative("go on"));
        assert!(evaluator.cache().is_empty().await);

        // Not cached, so a retry asks again.
        evaluator.evaluate(&request("go on")).await.unwrap();
    }

    #[tokio::test]
    async fn test_transport_error_returns_conservative_verdict() {
        let mut mock = MockJudgmentService::new();
        mock.expect_judge()
            .times(1)
            .returning(|_, _| Err(anyhow!("connection reset")));
        let evaluator = evaluator(mock);

        let verdict = evaluator.evaluate(&request("go on")).await.unwrap();
        assert!(!verdict.used_correctly);
        assert!(!verdict.used_target_phrase);
        assert!(verdict.feedback.contains("go on"));
    }

    #[tokio::test]
    async fn test_prompt_is_scoped_to_given_definition() {
        let mut mock = MockJudgmentService::new();
        mock.expect_judge()
            .withf(|system, prompt| {
                system.contains("Return only valid JSON")
                    && prompt.contains("Meaning: happen, take place")
                    && prompt.contains("Student said: \"what's going on?\"")
            })
            .times(1)
            .returning(|_, _| Ok(r#"{"used_correctly": true}"#.into()));
        let evaluator = evaluator(mock);

        let verdict = evaluator.evaluate(&request("what's going on?")).await.unwrap();
        assert!(verdict.used_correctly);
        assert!(!verdict.used_target_phrase);
    }

    #[test]
    fn test_build_prompt_limits_examples_and_adds_speaker() {
        let evaluator = evaluator(MockJudgmentService::new());
        let req = request("hi")
            .with_examples(vec!["a".into(), "b".into(), "c".into(), "d".into()])
            .with_speaker("Mr. Yang");
        let prompt = evaluator.build_prompt(&req);

        assert!(prompt.contains("- a\n- b\n- c"));
        assert!(!prompt.contains("- d"));
        assert!(prompt.contains("Speaking with Mr. Yang"));
        assert!(!prompt.contains("translation"));
    }

    #[test]
    fn test_build_prompt_mentions_accepted_translation_language() {
        let evaluator = TurnEvaluator::new(Arc::new(MockJudgmentService::new()), TEMPLATE)
            .with_translation_language(Some("Spanish".into()));
        let prompt = evaluator.build_prompt(&request("continuar"));
        assert!(prompt.contains("given in Spanish"));
    }

    #[test]
    fn test_parse_verdict_accepts_fenced_and_legacy_output() {
        let fenced = "```json\n{\"used_verb\": true, \"used_correctly\": false, \"feedback\": \"Wrong sense.\"}\n```";
        let verdict = parse_verdict(fenced).unwrap();
        assert!(verdict.used_target_phrase);
        assert!(!verdict.used_correctly);
        assert_eq!(verdict.feedback, "Wrong sense.");

        let camel = r#"{"usedTargetPhrase": true, "usedCorrectly": true, "feedback": ""}"#;
        assert!(parse_verdict(camel).unwrap().used_correctly);

        assert!(parse_verdict("not json").is_err());
    }
}
