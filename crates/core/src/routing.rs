//! Session Mode Routing
//!
//! Turns the metadata a participant joined with into exactly one
//! [`ConversationMode`]. Missing or unreadable metadata is `Pending` (ask
//! again later); present-but-incomplete metadata is a [`ConfigurationError`].

use crate::{
    error::ConfigurationError,
    lexical::{LexicalSense, SessionContext, TargetLexicalItem},
    metadata::{
        ActivityType, ParticipantInfo, ParticipantMetadata, PhrasalVerbMetadata, VoiceCardData,
    },
    mode::{ConversationMode, DEFAULT_MAX_TURNS, ExplanationConfig, ScenarioConfig},
};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Ready(ConversationMode),
    Pending,
}

pub struct SessionModeRouter {
    end_on_first_success: bool,
    resolved: Option<(String, ConversationMode)>,
}

impl Default for SessionModeRouter {
    fn default() -> Self {
        Self::new(true)
    }
}

impl SessionModeRouter {
    /// `end_on_first_success` is applied to every explanation mode this
    /// router produces.
    pub fn new(end_on_first_success: bool) -> Self {
        Self {
            end_on_first_success,
            resolved: None,
        }
    }

    /// Resolves the participant's mode and installs the target item into the
    /// session context. Repeating the call for an already-resolved
    /// participant returns the same mode without touching the context again.
    pub async fn resolve(
        &mut self,
        participant: &ParticipantInfo,
        context: &Mutex<SessionContext>,
    ) -> Result<Resolution, ConfigurationError> {
        if let Some((identity, mode)) = &self.resolved {
            if identity == &participant.identity {
                info!(participant = %identity, "Participant already resolved; reusing mode");
                return Ok(Resolution::Ready(mode.clone()));
            }
        }

        let resolution = resolve_metadata(
            participant.structured_metadata(),
            participant.legacy_voice_card(),
            self.end_on_first_success,
        )?;

        if let Resolution::Ready(mode) = &resolution {
            let mut ctx = context.lock().await;
            if let Some(name) = &participant.name {
                ctx.participant_name = name.clone();
            }
            if let ConversationMode::Explanation(config) = mode {
                if ctx.install_target(config.target_item.clone()) {
                    info!(
                        phrase = %config.target_item.phrase(),
                        senses = config.target_item.total_senses(),
                        "Installed target lexical item"
                    );
                }
            }
            self.resolved = Some((participant.identity.clone(), mode.clone()));
        }
        Ok(resolution)
    }
}

/// Pure routing decision from raw metadata.
///
/// `metadata` is the structured JSON string; `legacy_voice_card` is the
/// string-encoded voice card some clients send as an attribute instead.
pub fn resolve_metadata(
    metadata: Option<&str>,
    legacy_voice_card: Option<&str>,
    end_on_first_success: bool,
) -> Result<Resolution, ConfigurationError> {
    let Some(raw) = metadata else {
        return resolve_legacy(legacy_voice_card, end_on_first_success);
    };

    let parsed: ParticipantMetadata = match serde_json::from_str(raw) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!(error = %e, "Participant metadata is not valid JSON; waiting for a proper connection");
            return Ok(Resolution::Pending);
        }
    };

    match parsed.activity() {
        Some(ActivityType::Context) => {
            info!("Routing to role-play mode");
            Ok(Resolution::Ready(ConversationMode::RolePlay(
                scenario_from_metadata(&parsed)?,
            )))
        }
        Some(ActivityType::Voice) => {
            let target = parsed
                .target_phrasal_verb
                .as_ref()
                .or_else(|| {
                    parsed
                        .voice_card_data
                        .as_ref()
                        .and_then(|card| card.target_phrasal_verb.as_ref())
                })
                .ok_or(ConfigurationError::MissingField("targetPhrasalVerb"))?;
            explanation(target, end_on_first_success)
        }
        other => {
            if let Some(card) = &parsed.voice_card_data {
                info!(activity = ?other, "No usable activity type; using voice card data");
                return explanation_from_card(card, end_on_first_success);
            }
            if legacy_voice_card.is_some() {
                return resolve_legacy(legacy_voice_card, end_on_first_success);
            }
            warn!(activity = ?other, "No activity type and no voice card data; waiting");
            Ok(Resolution::Pending)
        }
    }
}

fn resolve_legacy(
    legacy_voice_card: Option<&str>,
    end_on_first_success: bool,
) -> Result<Resolution, ConfigurationError> {
    let Some(raw) = legacy_voice_card else {
        warn!("No metadata and no legacy voice card attribute; waiting");
        return Ok(Resolution::Pending);
    };
    match serde_json::from_str::<VoiceCardData>(raw) {
        Ok(card) => {
            info!(title = ?card.title, "Using legacy voice card attribute");
            explanation_from_card(&card, end_on_first_success)
        }
        Err(e) => {
            warn!(error = %e, "Legacy voice card attribute is not valid JSON; waiting");
            Ok(Resolution::Pending)
        }
    }
}

fn explanation_from_card(
    card: &VoiceCardData,
    end_on_first_success: bool,
) -> Result<Resolution, ConfigurationError> {
    let target = card
        .target_phrasal_verb
        .as_ref()
        .ok_or(ConfigurationError::MissingField("voiceCardData.targetPhrasalVerb"))?;
    explanation(target, end_on_first_success)
}

fn explanation(
    target: &PhrasalVerbMetadata,
    end_on_first_success: bool,
) -> Result<Resolution, ConfigurationError> {
    let verb = target
        .verb
        .as_deref()
        .ok_or(ConfigurationError::MissingField("targetPhrasalVerb.verb"))?;
    let senses = target
        .senses
        .iter()
        .map(|s| LexicalSense::new(s.sense_number, s.definition.clone(), s.examples.clone()))
        .collect();
    let item = TargetLexicalItem::new(verb, senses)?;
    info!(phrase = %item.phrase(), senses = item.total_senses(), "Routing to explanation mode");
    Ok(Resolution::Ready(ConversationMode::Explanation(
        ExplanationConfig::new(item).with_end_on_first_success(end_on_first_success),
    )))
}

fn scenario_from_metadata(meta: &ParticipantMetadata) -> Result<ScenarioConfig, ConfigurationError> {
    let scenario = meta
        .scenario
        .as_ref()
        .ok_or(ConfigurationError::MissingField("scenario"))?;
    let target = meta
        .target_phrasal_verb
        .as_ref()
        .ok_or(ConfigurationError::MissingField("targetPhrasalVerb"))?;

    // The tested sense is the flat definition when given, else the first sense.
    let first_sense = target.senses.first();
    let definition = target
        .definition
        .clone()
        .or_else(|| first_sense.map(|s| s.definition.clone()))
        .unwrap_or_default();
    let examples = match (first_sense, &target.example) {
        (Some(sense), _) if !sense.examples.is_empty() => sense.examples.clone(),
        (_, Some(example)) => vec![example.clone()],
        _ => Vec::new(),
    };
    let max_turns = match scenario.max_turns {
        None => DEFAULT_MAX_TURNS,
        Some(n) => u32::try_from(n).map_err(|_| {
            ConfigurationError::invalid("scenario.maxTurns", format!("{n} is out of range"))
        })?,
    };

    if meta.voice_persona.is_none() {
        warn!("voicePersona is missing from metadata; the speech layer will use its fallback voice");
    }

    Ok(ScenarioConfig::new(
        scenario.character.clone().unwrap_or_default(),
        scenario.situation.clone().unwrap_or_default(),
        target.verb.clone().unwrap_or_default(),
        definition,
        max_turns,
    )?
    .with_examples(examples)
    .with_conversation_starter(scenario.conversation_starter.clone())
    .with_context_text(scenario.context_text.clone())
    .with_voice_persona(meta.voice_persona.clone()))
}

/// Bounded exponential backoff for waiting on participant metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_millis(500))
    }
}

impl RetryPolicy {
    /// Delays double from `base_delay` and are capped at eight times it.
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay: base_delay.saturating_mul(8),
        }
    }

    /// Delay to wait after the given zero-based failed attempt.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::LEGACY_VOICE_CARD_ATTRIBUTE;
    use crate::mode::ModeKind;
    use std::collections::HashMap;

    const CONTEXT: &str = r#"{
        "activityType": "context",
        "scenario": { "character": "Mr. Yang", "situation": "a paused meeting", "maxTurns": 3,
                      "conversationStarter": "Where were we?" },
        "targetPhrasalVerb": { "verb": "pull in", "senses": [
            { "senseNumber": 1, "definition": "arrive at a station", "examples": ["The train pulled in."] }
        ] }
    }"#;

    const VOICE: &str = r#"{
        "activityType": "voice",
        "targetPhrasalVerb": { "verb": "go on", "senses": [
            { "senseNumber": 1, "definition": "happen, take place", "examples": ["What's going on?"] },
            { "senseNumber": 2, "definition": "continue", "examples": ["Please go on."] }
        ] }
    }"#;

    const CARD: &str = r#"{ "id": "c1", "title": "Go on", "type": "voice",
        "targetPhrasalVerb": { "verb": "go on", "senses": [
            { "senseNumber": 1, "definition": "happen, take place", "examples": [] }
        ] } }"#;

    fn participant(metadata: Option<&str>, legacy: Option<&str>) -> ParticipantInfo {
        let mut attributes = HashMap::new();
        if let Some(card) = legacy {
            attributes.insert(LEGACY_VOICE_CARD_ATTRIBUTE.to_string(), card.to_string());
        }
        ParticipantInfo {
            identity: "student-1".into(),
            name: Some("Ana".into()),
            metadata: metadata.map(str::to_string),
            attributes,
        }
    }

    #[test]
    fn test_context_metadata_routes_to_role_play() {
        let Resolution::Ready(ConversationMode::RolePlay(config)) =
            resolve_metadata(Some(CONTEXT), None, true).unwrap()
        else {
            panic!("expected role-play");
        };
        assert_eq!(config.character, "Mr. Yang");
        assert_eq!(config.target_phrase, "pull in");
        assert_eq!(config.target_definition, "arrive at a station");
        assert_eq!(config.max_turns, 3);
        assert_eq!(config.examples, vec!["The train pulled in."]);
        assert_eq!(config.conversation_starter.as_deref(), Some("Where were we?"));
    }

    #[test]
    fn test_context_without_character_is_configuration_error() {
        let raw = r#"{ "activityType": "context",
            "scenario": { "situation": "a meeting" },
            "targetPhrasalVerb": { "verb": "pull in", "definition": "arrive" } }"#;
        assert_eq!(
            resolve_metadata(Some(raw), None, true).unwrap_err(),
            ConfigurationError::MissingField("scenario.character")
        );
    }

    #[test]
    fn test_context_without_definition_is_configuration_error() {
        let raw = r#"{ "activityType": "context",
            "scenario": { "character": "Mr. Yang", "situation": "a meeting" },
            "targetPhrasalVerb": { "verb": "pull in" } }"#;
        assert_eq!(
            resolve_metadata(Some(raw), None, true).unwrap_err(),
            ConfigurationError::MissingField("targetPhrasalVerb.definition")
        );
    }

    #[test]
    fn test_context_defaults_max_turns() {
        let raw = r#"{ "activityType": "context",
            "scenario": { "character": "Mr. Yang", "situation": "a meeting" },
            "targetPhrasalVerb": { "verb": "pull in", "definition": "arrive", "example": "We pulled in late." } }"#;
        let Resolution::Ready(mode) = resolve_metadata(Some(raw), None, true).unwrap() else {
            panic!("expected ready");
        };
        assert_eq!(mode.max_turns(), Some(DEFAULT_MAX_TURNS));
        let ConversationMode::RolePlay(config) = mode else {
            panic!("expected role-play");
        };
        assert_eq!(config.examples, vec!["We pulled in late."]);
    }

    #[test]
    fn test_voice_metadata_routes_to_explanation() {
        let Resolution::Ready(mode) = resolve_metadata(Some(VOICE), None, false).unwrap() else {
            panic!("expected ready");
        };
        assert_eq!(mode.kind(), ModeKind::Explanation);
        assert!(!mode.end_on_first_success());
        let ConversationMode::Explanation(config) = mode else {
            unreachable!()
        };
        assert_eq!(config.target_item.total_senses(), 2);
    }

    #[test]
    fn test_voice_without_target_is_configuration_error() {
        assert_eq!(
            resolve_metadata(Some(r#"{"activityType": "voice"}"#), None, true).unwrap_err(),
            ConfigurationError::MissingField("targetPhrasalVerb")
        );
    }

    #[test]
    fn test_voice_with_blank_sense_definition_is_configuration_error() {
        let metadata = r#"{
            "activityType": "voice",
            "targetPhrasalVerb": {
                "verb": "close down",
                "senses": [{"senseNumber": 1, "definition": ""}]
            }
        }"#;
        assert_eq!(
            resolve_metadata(Some(metadata), None, true).unwrap_err(),
            ConfigurationError::MissingField("targetPhrasalVerb.senses.definition")
        );
    }

    #[test]
    fn test_missing_or_malformed_metadata_is_pending() {
        assert_eq!(resolve_metadata(None, None, true).unwrap(), Resolution::Pending);
        assert_eq!(
            resolve_metadata(Some("{not json"), None, true).unwrap(),
            Resolution::Pending
        );
        assert_eq!(
            resolve_metadata(None, Some("{not json"), true).unwrap(),
            Resolution::Pending
        );
    }

    #[test]
    fn test_unknown_activity_needs_voice_card_data() {
        assert_eq!(
            resolve_metadata(Some(r#"{"activityType": "flashcard"}"#), None, true).unwrap(),
            Resolution::Pending
        );

        let with_card = format!(r#"{{ "voiceCardData": {CARD} }}"#);
        let resolution = resolve_metadata(Some(&with_card), None, true).unwrap();
        assert!(matches!(
            resolution,
            Resolution::Ready(ConversationMode::Explanation(_))
        ));

        let resolution = resolve_metadata(Some("{}"), Some(CARD), true).unwrap();
        assert!(matches!(
            resolution,
            Resolution::Ready(ConversationMode::Explanation(_))
        ));
    }

    #[test]
    fn test_legacy_attribute_alone_routes_to_explanation() {
        let Resolution::Ready(mode) = resolve_metadata(None, Some(CARD), true).unwrap() else {
            panic!("expected ready");
        };
        assert_eq!(mode.target_phrase(), "go on");
    }

    #[tokio::test]
    async fn test_resolve_installs_target_once() {
        let mut router = SessionModeRouter::new(true);
        let context = Mutex::new(SessionContext::default());
        let info = participant(Some(VOICE), None);

        let first = router.resolve(&info, &context).await.unwrap();
        context
            .lock()
            .await
            .target_item
            .as_mut()
            .unwrap()
            .mark_explained(1);

        let second = router.resolve(&info, &context).await.unwrap();
        assert_eq!(first, second);

        let ctx = context.lock().await;
        assert_eq!(ctx.participant_name, "Ana");
        // Re-resolving did not reinstall a fresh item over the progress made.
        assert_eq!(ctx.target_item.as_ref().unwrap().explained_senses(), 1);
    }

    #[tokio::test]
    async fn test_pending_resolution_leaves_context_untouched() {
        let mut router = SessionModeRouter::default();
        let context = Mutex::new(SessionContext::new("placeholder"));

        let resolution = router
            .resolve(&participant(None, None), &context)
            .await
            .unwrap();
        assert_eq!(resolution, Resolution::Pending);
        let ctx = context.lock().await;
        assert_eq!(ctx.participant_name, "placeholder");
        assert!(ctx.target_item.is_none());
    }

    #[test]
    fn test_retry_backoff_doubles_and_caps() {
        let policy = RetryPolicy::new(6, Duration::from_millis(100));
        let delays: Vec<_> = (0..6).map(|a| policy.backoff(a)).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(800),
                Duration::from_millis(800),
                Duration::from_millis(800),
            ]
        );
        assert_eq!(policy.backoff(64), Duration::from_millis(800));
    }
}
