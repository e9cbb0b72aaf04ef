//! Extraction Helper: two-stage identity extraction run during the
//! Conversation Core's turn algorithm. Regex pass first (cheap, always
//! runs even if the LLM call later fails); LLM pass second, parsed
//! leniently — a malformed response degrades to an empty map, never an
//! error that aborts the turn.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value as Json;
use std::collections::HashMap;
use tracing::debug;

use crate::config::PromptsConfig;
use crate::services::llm_service::{ChatMessage, LlmService};

static EMAIL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}").unwrap());

static PHONE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\+?\d[\d\s().-]{7,}\d").unwrap());

pub struct ExtractionHelper {
    llm: std::sync::Arc<LlmService>,
    system_prompt: String,
}

impl ExtractionHelper {
    pub fn new(llm: std::sync::Arc<LlmService>, prompts: &PromptsConfig) -> Self {
        Self { llm, system_prompt: prompts.context_extraction_system_prompt.clone() }
    }

    /// Regex pass: pure, no I/O. Always safe to run first.
    pub fn extract_regex(message: &str) -> HashMap<String, Json> {
        let mut out = HashMap::new();
        if let Some(m) = EMAIL_RE.find(message) {
            out.insert("email".to_string(), Json::String(m.as_str().to_string()));
        }
        if let Some(m) = PHONE_RE.find(message) {
            let digits: String = m.as_str().chars().filter(|c| c.is_ascii_digit() || *c == '+').collect();
            if digits.len() >= 8 {
                out.insert("phone".to_string(), Json::String(m.as_str().trim().to_string()));
            }
        }
        out
    }

    /// LLM pass: a single non-streaming completion asking for a JSON object
    /// of newly observed entities. Never propagates a provider error —
    /// callers merge an empty map instead so the turn still proceeds.
    pub async fn extract_llm(&self, message: &str) -> HashMap<String, Json> {
        let messages = vec![
            ChatMessage::system(self.system_prompt.clone()),
            ChatMessage::user(message.to_string()),
        ];

        match self.llm.generate(messages).await {
            Ok(response) => Self::parse_entities_json(&response.text),
            Err(e) => {
                debug!("entity extraction LLM call failed, degrading to empty map: {e}");
                HashMap::new()
            }
        }
    }

    /// Runs both passes and merges: regex first, LLM keys override on
    /// conflict.
    pub async fn extract(&self, message: &str) -> HashMap<String, Json> {
        let mut merged = Self::extract_regex(message);
        for (k, v) in self.extract_llm(message).await {
            merged.insert(k, v);
        }
        merged
    }

    fn parse_entities_json(text: &str) -> HashMap<String, Json> {
        let candidate = Self::extract_json_object(text).unwrap_or(text);
        serde_json::from_str::<HashMap<String, Json>>(candidate).unwrap_or_default()
    }

    /// LLMs frequently wrap JSON in prose or code fences; take the first
    /// balanced `{...}` span as a best-effort extraction.
    fn extract_json_object(text: &str) -> Option<&str> {
        let start = text.find('{')?;
        let end = text.rfind('}')?;
        if end <= start {
            return None;
        }
        Some(&text[start..=end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regex_pass_finds_email() {
        let out = ExtractionHelper::extract_regex("you can reach me at foo@bar.com anytime");
        assert_eq!(out.get("email").and_then(|v| v.as_str()), Some("foo@bar.com"));
    }

    #[test]
    fn regex_pass_finds_phone() {
        let out = ExtractionHelper::extract_regex("call me at +1 (555) 123-4567");
        assert!(out.contains_key("phone"));
    }

    #[test]
    fn regex_pass_empty_when_no_identity_present() {
        let out = ExtractionHelper::extract_regex("what is your refund policy?");
        assert!(out.is_empty());
    }

    #[test]
    fn json_extraction_tolerates_surrounding_prose() {
        let text = r#"Sure, here you go: {"name": "Jane Doe", "email": "jane@x.co"} hope that helps"#;
        let parsed = ExtractionHelper::parse_entities_json(text);
        assert_eq!(parsed.get("name").and_then(|v| v.as_str()), Some("Jane Doe"));
        assert_eq!(parsed.get("email").and_then(|v| v.as_str()), Some("jane@x.co"));
    }

    #[test]
    fn malformed_json_degrades_to_empty_map() {
        let parsed = ExtractionHelper::parse_entities_json("not json at all");
        assert!(parsed.is_empty());
    }
}
