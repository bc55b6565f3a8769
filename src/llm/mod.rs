//! Language-model completion seam
//!
//! The model is a black box that turns a prompt into JSON. Its output is
//! untrusted: every caller validates the payload against the schema it asked
//! for before using it.

use crate::error::OrchestrationError;
use crate::schema::Schema;
use crate::Result;
use async_trait::async_trait;
use serde_json::Value;

pub mod gemini;
pub use gemini::GeminiClient;

#[async_trait]
pub trait CompletionService: Send + Sync {
    /// Complete `prompt`, asking for a payload shaped like `response_schema`.
    async fn complete(&self, prompt: &str, response_schema: &Schema) -> Result<Value>;
}

/// Parse the JSON payload out of model text. Handles ```json fences and
/// prose around a single object.
pub fn extract_json(text: &str) -> Result<Value> {
    let trimmed = text.trim();

    let unfenced = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .map(|rest| rest.trim_end().trim_end_matches("```").trim())
        .unwrap_or(trimmed);

    if let Ok(value) = serde_json::from_str::<Value>(unfenced) {
        return Ok(value);
    }

    // fall back to the outermost { ... } block
    if let (Some(start), Some(end)) = (unfenced.find('{'), unfenced.rfind('}')) {
        if start < end {
            if let Ok(value) = serde_json::from_str::<Value>(&unfenced[start..=end]) {
                return Ok(value);
            }
        }
    }

    Err(OrchestrationError::LlmError(format!(
        "no JSON object in model output: {}",
        truncate(trimmed, 200)
    )))
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
