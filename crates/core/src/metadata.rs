//! Wire types for the metadata a participant carries when joining a session.
//!
//! Every field is optional at this layer. Whether a field is *required*
//! depends on the activity, and that decision belongs to the router.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Participant attribute that carries string-encoded voice card JSON for
/// clients that predate structured metadata.
pub const LEGACY_VOICE_CARD_ATTRIBUTE: &str = "voice_card_data";

/// What the connecting client told us about the participant.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParticipantInfo {
    pub identity: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Structured metadata as a raw JSON string, exactly as received.
    #[serde(default)]
    pub metadata: Option<String>,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

impl ParticipantInfo {
    pub fn legacy_voice_card(&self) -> Option<&str> {
        self.attributes
            .get(LEGACY_VOICE_CARD_ATTRIBUTE)
            .map(String::as_str)
            .filter(|s| !s.trim().is_empty())
    }

    /// Structured metadata, treating an empty string as absent.
    pub fn structured_metadata(&self) -> Option<&str> {
        self.metadata.as_deref().filter(|s| !s.trim().is_empty())
    }

    /// Applies a later update from the client. Present fields overwrite,
    /// absent fields are kept.
    pub fn merge(&mut self, metadata: Option<String>, attributes: HashMap<String, String>) {
        if metadata.is_some() {
            self.metadata = metadata;
        }
        self.attributes.extend(attributes);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivityType {
    Context,
    Voice,
    Other(String),
}

impl From<&str> for ActivityType {
    fn from(value: &str) -> Self {
        match value {
            "context" => Self::Context,
            "voice" => Self::Voice,
            other => Self::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantMetadata {
    #[serde(default)]
    pub activity_type: Option<String>,
    #[serde(default)]
    pub scenario: Option<ScenarioMetadata>,
    #[serde(default)]
    pub target_phrasal_verb: Option<PhrasalVerbMetadata>,
    /// Opaque to the core; handed through to the speech layer.
    #[serde(default)]
    pub voice_persona: Option<Value>,
    #[serde(default)]
    pub voice_card_data: Option<VoiceCardData>,
}

impl ParticipantMetadata {
    pub fn activity(&self) -> Option<ActivityType> {
        self.activity_type.as_deref().map(ActivityType::from)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioMetadata {
    #[serde(default)]
    pub character: Option<String>,
    #[serde(default)]
    pub situation: Option<String>,
    #[serde(default)]
    pub max_turns: Option<i64>,
    #[serde(default)]
    pub conversation_starter: Option<String>,
    #[serde(default)]
    pub context_text: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhrasalVerbMetadata {
    #[serde(default)]
    pub verb: Option<String>,
    #[serde(default)]
    pub senses: Vec<SenseMetadata>,
    /// Context cards carry a single flat definition instead of senses.
    #[serde(default)]
    pub definition: Option<String>,
    #[serde(default)]
    pub example: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SenseMetadata {
    pub sense_number: u32,
    pub definition: String,
    #[serde(default)]
    pub examples: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceCardData {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub target_phrasal_verb: Option<PhrasalVerbMetadata>,
}
