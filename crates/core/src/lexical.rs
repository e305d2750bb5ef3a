use crate::error::ConfigurationError;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// One distinct meaning of a target phrase.
///
/// The `explained` flag is flipped by the tutor's tool calls or by a correct
/// evaluated turn, and never flips back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LexicalSense {
    pub sense_number: u32,
    pub definition: String,
    #[serde(default)]
    pub examples: Vec<String>,
    #[serde(default)]
    pub explained: bool,
}

impl LexicalSense {
    /// Creates a new, unexplained sense.
    pub fn new(sense_number: u32, definition: impl Into<String>, examples: Vec<String>) -> Self {
        Self {
            sense_number,
            definition: definition.into(),
            examples,
            explained: false,
        }
    }
}

/// Result of trying to mark a sense as explained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkOutcome {
    /// The sense was unexplained and is now explained.
    Marked,
    AlreadyExplained,
    UnknownSense,
}

/// The phrase being practiced in a session together with its senses.
///
/// Fields are private so the non-empty, unique-sense-number invariant can only
/// be established through [`TargetLexicalItem::new`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TargetLexicalItem {
    phrase: String,
    senses: Vec<LexicalSense>,
}

impl TargetLexicalItem {
    pub fn new(
        phrase: impl Into<String>,
        senses: Vec<LexicalSense>,
    ) -> Result<Self, ConfigurationError> {
        let phrase = phrase.into();
        if phrase.trim().is_empty() {
            return Err(ConfigurationError::MissingField("targetPhrasalVerb.verb"));
        }
        if senses.is_empty() {
            return Err(ConfigurationError::invalid(
                "targetPhrasalVerb.senses",
                "at least one sense is required",
            ));
        }
        let mut seen = HashSet::new();
        for sense in &senses {
            if sense.definition.trim().is_empty() {
                return Err(ConfigurationError::MissingField(
                    "targetPhrasalVerb.senses.definition",
                ));
            }
            if !seen.insert(sense.sense_number) {
                return Err(ConfigurationError::invalid(
                    "targetPhrasalVerb.senses",
                    format!("duplicate senseNumber {}", sense.sense_number),
                ));
            }
        }
        Ok(Self { phrase, senses })
    }

    pub fn phrase(&self) -> &str {
        &self.phrase
    }

    pub fn senses(&self) -> &[LexicalSense] {
        &self.senses
    }

    pub fn sense(&self, sense_number: u32) -> Option<&LexicalSense> {
        self.senses.iter().find(|s| s.sense_number == sense_number)
    }

    pub fn total_senses(&self) -> usize {
        self.senses.len()
    }

    pub fn explained_senses(&self) -> usize {
        self.senses.iter().filter(|s| s.explained).count()
    }

    pub fn remaining_senses(&self) -> usize {
        self.total_senses() - self.explained_senses()
    }

    /// First sense, in declaration order, that has not been explained yet.
    pub fn next_unexplained(&self) -> Option<&LexicalSense> {
        self.senses.iter().find(|s| !s.explained)
    }

    pub fn is_complete(&self) -> bool {
        self.remaining_senses() == 0
    }

    /// Marks a sense as explained. Repeated or unknown sense numbers leave the
    /// counts untouched.
    pub fn mark_explained(&mut self, sense_number: u32) -> MarkOutcome {
        match self
            .senses
            .iter_mut()
            .find(|s| s.sense_number == sense_number)
        {
            Some(sense) if sense.explained => MarkOutcome::AlreadyExplained,
            Some(sense) => {
                sense.explained = true;
                MarkOutcome::Marked
            }
            None => MarkOutcome::UnknownSense,
        }
    }
}

/// Mutable per-connection state shared between the controller and the tool
/// handlers. Lives exactly as long as the connection.
#[derive(Debug, Clone, Default)]
pub struct SessionContext {
    pub participant_name: String,
    pub target_item: Option<TargetLexicalItem>,
}

impl SessionContext {
    pub fn new(participant_name: impl Into<String>) -> Self {
        Self {
            participant_name: participant_name.into(),
            target_item: None,
        }
    }

    /// Installs the session's target item. Returns `false` and keeps the
    /// existing item if one was already installed.
    pub fn install_target(&mut self, item: TargetLexicalItem) -> bool {
        if self.target_item.is_some() {
            return false;
        }
        self.target_item = Some(item);
        true
    }
}
