//! JSON-enforcing adapter around the LLM collaborator.
//!
//! The LLM must return a single JSON object satisfying the schema's
//! required top-level keys. A first failure gets one repair prompt; a
//! second failure is unrecoverable.

use std::sync::Arc;

use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::pipeline::schema::SchemaDoc;

use super::llm::{LlmClient, LlmError};

const EXTRACT_SYSTEM_PROMPT: &str = "You convert OCR markdown into structured data. \
Respond with a single JSON object conforming to the provided JSON Schema. \
Output JSON only, with no surrounding prose or code fences.";
const REPAIR_SUFFIX: &str =
    "\n\nNOTE: The previous response was not valid JSON for the schema. Return only a valid JSON object.";
const SCHEMA_SYSTEM_PROMPT: &str = "You design JSON Schemas for document extraction. \
Respond with a single JSON object {\"name\", \"description\", \"schema\"} where `schema` \
is a JSON Schema describing the key fields of the document. Output JSON only.";
const DEFAULT_MAX_ATTEMPTS: u8 = 2;

#[derive(Debug, Clone)]
pub struct StructuredExtraction {
    pub data: JsonValue,
    pub model: String,
    /// Summed across the initial call and any repair call.
    pub token_count: u64,
}

#[derive(Debug, Clone)]
pub struct GeneratedSchema {
    pub name: String,
    pub description: String,
    pub schema: JsonValue,
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error(transparent)]
    Llm(#[from] LlmError),
    /// The model output could not be reconciled to the schema after the
    /// repair attempt. Never retried.
    #[error("llm output not reconcilable to schema: {reason}")]
    ParseFailed { reason: String },
}

impl ExtractError {
    pub fn is_retryable(&self) -> bool {
        match self {
            ExtractError::Llm(error) => error.is_retryable(),
            ExtractError::ParseFailed { .. } => false,
        }
    }
}

#[derive(Clone)]
pub struct StructuredExtractor {
    client: Arc<dyn LlmClient>,
    max_attempts: u8,
}

impl StructuredExtractor {
    pub fn new(client: Arc<dyn LlmClient>) -> Self {
        Self {
            client,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub async fn extract(
        &self,
        markdown: &str,
        schema: &SchemaDoc,
        hints: Option<&str>,
    ) -> Result<StructuredExtraction, ExtractError> {
        let required = schema.required_keys();
        let base_prompt = build_extract_prompt(markdown, schema, hints);

        let mut total_tokens = 0_u64;
        let mut last_reason = String::new();

        for attempt in 0..self.max_attempts {
            let mut prompt = base_prompt.clone();
            if attempt > 0 {
                prompt.push_str(REPAIR_SUFFIX);
            }

            let completion = self.client.complete(EXTRACT_SYSTEM_PROMPT, &prompt).await?;
            total_tokens = total_tokens.saturating_add(completion.usage.total_tokens);

            match coerce_json_object(&completion.text, &required) {
                Ok(data) => {
                    return Ok(StructuredExtraction {
                        data,
                        model: completion.model,
                        token_count: total_tokens,
                    });
                }
                Err(reason) => {
                    tracing::warn!(attempt, %reason, "llm output failed shape validation");
                    last_reason = reason;
                }
            }
        }

        Err(ExtractError::ParseFailed {
            reason: last_reason,
        })
    }

    pub async fn generate_schema(
        &self,
        markdown: &str,
        hints: Option<&str>,
    ) -> Result<GeneratedSchema, ExtractError> {
        let mut prompt = String::from("Design a JSON Schema for extracting data from this document.\n");
        if let Some(hints) = hints {
            prompt.push_str("Guidance: ");
            prompt.push_str(hints);
            prompt.push('\n');
        }
        prompt.push_str("\nDocument markdown:\n");
        prompt.push_str(markdown);

        let required = ["name".to_string(), "description".to_string(), "schema".to_string()];

        let mut last_reason = String::new();
        for attempt in 0..self.max_attempts {
            let mut prompt = prompt.clone();
            if attempt > 0 {
                prompt.push_str(REPAIR_SUFFIX);
            }
            let completion = self.client.complete(SCHEMA_SYSTEM_PROMPT, &prompt).await?;
            match coerce_json_object(&completion.text, &required) {
                Ok(value) => {
                    return Ok(GeneratedSchema {
                        name: value["name"].as_str().unwrap_or("generated").to_string(),
                        description: value["description"].as_str().unwrap_or_default().to_string(),
                        schema: value["schema"].clone(),
                    });
                }
                Err(reason) => last_reason = reason,
            }
        }
        Err(ExtractError::ParseFailed {
            reason: last_reason,
        })
    }
}

fn build_extract_prompt(markdown: &str, schema: &SchemaDoc, hints: Option<&str>) -> String {
    let mut prompt = String::with_capacity(markdown.len() + schema.schema.len() + 256);
    prompt.push_str("JSON Schema:\n");
    prompt.push_str(&schema.schema);
    prompt.push('\n');
    if let Some(hints) = hints {
        prompt.push_str("\nGuidance from the caller:\n");
        prompt.push_str(hints);
        prompt.push('\n');
    }
    prompt.push_str("\nDocument markdown:\n");
    prompt.push_str(markdown);
    prompt
}

/// Accept the response only as a single JSON object carrying every
/// required top-level key. Falls back to scanning for balanced object
/// candidates when the raw text does not parse; an ambiguous response
/// (multiple distinct candidates) is rejected so the repair prompt runs.
fn coerce_json_object(raw: &str, required_keys: &[String]) -> Result<JsonValue, String> {
    let direct = serde_json::from_str::<JsonValue>(raw.trim()).ok();
    let value = match direct {
        Some(value) if value.is_object() => value,
        _ => {
            let mut candidates = balanced_object_candidates(raw);
            candidates.dedup();
            match candidates.len() {
                0 => return Err("no JSON object found in response".to_string()),
                1 => candidates.remove(0),
                n => return Err(format!("ambiguous response with {n} JSON candidates")),
            }
        }
    };

    let object = value
        .as_object()
        .ok_or_else(|| "response is not a JSON object".to_string())?;
    for key in required_keys {
        if !object.contains_key(key) {
            return Err(format!("missing required key `{key}`"));
        }
    }
    Ok(value)
}

/// Scan for top-level balanced `{…}` spans that parse as JSON objects.
fn balanced_object_candidates(raw: &str) -> Vec<JsonValue> {
    let bytes = raw.as_bytes();
    let mut candidates = Vec::new();
    let mut depth = 0_usize;
    let mut start = None;
    let mut in_string = false;
    let mut escaped = false;

    for (index, &byte) in bytes.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if byte == b'\\' {
                escaped = true;
            } else if byte == b'"' {
                in_string = false;
            }
            continue;
        }
        match byte {
            b'"' if depth > 0 => in_string = true,
            b'{' => {
                if depth == 0 {
                    start = Some(index);
                }
                depth += 1;
            }
            b'}' => {
                if depth > 0 {
                    depth -= 1;
                    if depth == 0 {
                        if let Some(begin) = start.take() {
                            if let Ok(value) =
                                serde_json::from_str::<JsonValue>(&raw[begin..=index])
                            {
                                if value.is_object() {
                                    candidates.push(value);
                                }
                            }
                        }
                    }
                }
            }
            _ => {}
        }
    }
    candidates
}
