//! Prompt templates used by the conversation modes and the evaluator.
//!
//! Templates are plain text with `{name}` placeholders, loaded by the service
//! from a directory of Markdown files keyed by file stem.

use anyhow::{Context, Result};
use std::collections::HashMap;

pub const EVALUATE_USAGE: &str = "evaluate_usage";
pub const EXPLANATION_AGENT: &str = "explanation_agent";
pub const ROLE_PLAY_AGENT: &str = "role_play_agent";

#[derive(Debug, Clone)]
pub struct PromptTemplates {
    pub evaluate_usage: String,
    pub explanation_agent: String,
    pub role_play_agent: String,
}

impl PromptTemplates {
    /// Picks the required templates out of a stem -> content map.
    pub fn from_map(prompts: &HashMap<String, String>) -> Result<Self> {
        let get = |key: &str| {
            prompts
                .get(key)
                .cloned()
                .with_context(|| format!("Missing prompt template: '{key}'"))
        };
        Ok(Self {
            evaluate_usage: get(EVALUATE_USAGE)?,
            explanation_agent: get(EXPLANATION_AGENT)?,
            role_play_agent: get(ROLE_PLAY_AGENT)?,
        })
    }
}

/// Substitutes every `{key}` in `template` in a single scan, so substituted
/// values are never expanded again. Unknown placeholders are left as-is.
pub fn render(template: &str, values: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let value = after.find('}').and_then(|close| {
            let key = &after[..close];
            values
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| (*v, close))
        });
        match value {
            Some((value, close)) => {
                out.push_str(value);
                rest = &after[close + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}
