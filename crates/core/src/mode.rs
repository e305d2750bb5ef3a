//! Conversation modes and their immutable configuration.

use crate::{
    error::ConfigurationError,
    lexical::TargetLexicalItem,
    prompts::{PromptTemplates, render},
    terminal::GracePeriods,
};
use serde::Serialize;
use serde_json::Value;

/// Turn limit used when a role-play scenario does not specify one.
pub const DEFAULT_MAX_TURNS: u32 = 5;

/// Configuration of a role-play scenario. Construction validates every
/// required field; nothing is defaulted silently except `max_turns`.
#[derive(Debug, Clone, PartialEq)]
pub struct ScenarioConfig {
    pub character: String,
    pub situation: String,
    pub target_phrase: String,
    pub target_definition: String,
    pub examples: Vec<String>,
    pub max_turns: u32,
    pub conversation_starter: Option<String>,
    pub context_text: Option<String>,
    pub voice_persona: Option<Value>,
}

impl ScenarioConfig {
    pub fn new(
        character: impl Into<String>,
        situation: impl Into<String>,
        target_phrase: impl Into<String>,
        target_definition: impl Into<String>,
        max_turns: u32,
    ) -> Result<Self, ConfigurationError> {
        let config = Self {
            character: character.into(),
            situation: situation.into(),
            target_phrase: target_phrase.into(),
            target_definition: target_definition.into(),
            examples: Vec::new(),
            max_turns,
            conversation_starter: None,
            context_text: None,
            voice_persona: None,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn with_examples(mut self, examples: Vec<String>) -> Self {
        self.examples = examples;
        self
    }

    pub fn with_conversation_starter(mut self, starter: Option<String>) -> Self {
        self.conversation_starter = starter.filter(|s| !s.trim().is_empty());
        self
    }

    pub fn with_context_text(mut self, context: Option<String>) -> Self {
        self.context_text = context.filter(|s| !s.trim().is_empty());
        self
    }

    pub fn with_voice_persona(mut self, persona: Option<Value>) -> Self {
        self.voice_persona = persona;
        self
    }

    fn validate(&self) -> Result<(), ConfigurationError> {
        let required = [
            ("scenario.character", &self.character),
            ("scenario.situation", &self.situation),
            ("targetPhrasalVerb.verb", &self.target_phrase),
            ("targetPhrasalVerb.definition", &self.target_definition),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(ConfigurationError::MissingField(field));
            }
        }
        if self.max_turns == 0 {
            return Err(ConfigurationError::invalid(
                "scenario.maxTurns",
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExplanationConfig {
    pub target_item: TargetLexicalItem,
    /// End the session on the first correctly explained sense rather than
    /// waiting for every sense.
    pub end_on_first_success: bool,
    pub max_turns: Option<u32>,
}

impl ExplanationConfig {
    pub fn new(target_item: TargetLexicalItem) -> Self {
        Self {
            target_item,
            end_on_first_success: true,
            max_turns: None,
        }
    }

    pub fn with_end_on_first_success(mut self, end_on_first_success: bool) -> Self {
        self.end_on_first_success = end_on_first_success;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModeKind {
    Explanation,
    RolePlay,
}

/// The practice mode selected for a session, chosen once per connection.
#[derive(Debug, Clone, PartialEq)]
pub enum ConversationMode {
    Explanation(ExplanationConfig),
    RolePlay(ScenarioConfig),
}

impl ConversationMode {
    pub fn kind(&self) -> ModeKind {
        match self {
            Self::Explanation(_) => ModeKind::Explanation,
            Self::RolePlay(_) => ModeKind::RolePlay,
        }
    }

    pub fn target_phrase(&self) -> &str {
        match self {
            Self::Explanation(config) => config.target_item.phrase(),
            Self::RolePlay(config) => &config.target_phrase,
        }
    }

    pub fn max_turns(&self) -> Option<u32> {
        match self {
            Self::Explanation(config) => config.max_turns,
            Self::RolePlay(config) => Some(config.max_turns),
        }
    }

    /// Role-play always ends on the first correct use.
    pub fn end_on_first_success(&self) -> bool {
        match self {
            Self::Explanation(config) => config.end_on_first_success,
            Self::RolePlay(_) => true,
        }
    }

    pub fn default_grace(&self) -> GracePeriods {
        match self {
            Self::Explanation(_) => GracePeriods::explanation(),
            Self::RolePlay(_) => GracePeriods::role_play(),
        }
    }

    /// Builds the conversational model's system prompt for this mode.
    pub fn system_prompt(&self, templates: &PromptTemplates) -> String {
        match self {
            Self::Explanation(config) => {
                let item = &config.target_item;
                let senses = item
                    .senses()
                    .iter()
                    .map(|sense| match sense.examples.first() {
                        Some(example) => format!(
                            "{}. {} (Example: {})",
                            sense.sense_number, sense.definition, example
                        ),
                        None => format!("{}. {}", sense.sense_number, sense.definition),
                    })
                    .collect::<Vec<_>>()
                    .join("\n");
                render(
                    &templates.explanation_agent,
                    &[
                        ("phrase", item.phrase()),
                        ("total_senses", &item.total_senses().to_string()),
                        ("senses", &senses),
                    ],
                )
            }
            Self::RolePlay(config) => render(
                &templates.role_play_agent,
                &[
                    ("character", &config.character),
                    ("situation", &config.situation),
                    ("context", config.context_text.as_deref().unwrap_or_default()),
                ],
            ),
        }
    }
}
