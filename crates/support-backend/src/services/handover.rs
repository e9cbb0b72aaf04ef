//! Handover Detector: pure pattern + history analysis over a single
//! customer turn. No I/O; deterministic on a fixed
//! input. Priority order (first match wins) is the contract — later rules
//! are never reached once an earlier one fires.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value as Json;
use std::collections::HashMap;

use crate::models::domain::{Message, SenderType};
use crate::utils::similarity::jaccard_similarity;

#[derive(Debug, Clone, PartialEq)]
pub struct HandoverVerdict {
    pub should_handover: bool,
    pub immediate: bool,
    pub reason: &'static str,
    pub confidence: f32,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct HandoverConfig {
    pub max_similar_questions: usize,
    pub similarity_threshold: f32,
    pub max_back_and_forth: usize,
    pub short_response_chars: usize,
    pub low_confidence_threshold: f32,
}

impl Default for HandoverConfig {
    fn default() -> Self {
        Self {
            max_similar_questions: 3,
            similarity_threshold: 0.7,
            max_back_and_forth: 6,
            short_response_chars: 120,
            low_confidence_threshold: 0.35,
        }
    }
}

static IMMEDIATE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)\b(speak|talk) (to|with) (a |an )?(human|agent|person|representative)\b",
        r"(?i)\b(real|live) (human|agent|person)\b",
        r"(?i)\bmanager\b",
        r"(?i)\bsupervisor\b",
        r"(?i)\b(lawyer|attorney|legal action|sue|lawsuit)\b",
        r"(?i)\bemergency\b",
        r"(?i)\bconnect me (to|with)\b",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static pattern"))
    .collect()
});

static ASSISTED_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)\b(billing|invoice|charge(d)?|refund)\b",
        r"(?i)\baccount (is )?locked\b",
        r"(?i)\bpayment (failed|declined|issue)\b",
        r"(?i)\b(technical|login|log in|password) (issue|problem|trouble)\b",
        r"(?i)\bcan'?t (log ?in|reset my password)\b",
        r"(?i)\bsubscription (issue|problem|cancel)\b",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static pattern"))
    .collect()
});

static FRUSTRATION_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)\bthis is (ridiculous|useless|a joke|terrible)\b",
        r"(?i)\b(so|very|extremely) frustrat(ed|ing)\b",
        r"(?i)\bnot (helping|helpful) at all\b",
        r"(?i)\bwaste of time\b",
        r"(?i)\bi'?m (so )?(angry|furious|fed up)\b",
        r"(?i)\bstill (not|haven'?t) (resolved|fixed|working)\b",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static pattern"))
    .collect()
});

fn has_identity(collected_entities: &HashMap<String, Json>) -> bool {
    ["email", "name", "phone"].iter().any(|k| collected_entities.contains_key(*k))
}

fn matches_any(patterns: &[Regex], text: &str) -> bool {
    patterns.iter().any(|p| p.is_match(text))
}

/// Runs the full priority chain against a single customer turn. Returns
/// `None` when no rule fires.
pub fn detect(
    current_message: &str,
    history: &[Message],
    collected_entities: &HashMap<String, Json>,
    config: &HandoverConfig,
) -> Option<HandoverVerdict> {
    if matches_any(&IMMEDIATE_PATTERNS, current_message) {
        return Some(HandoverVerdict {
            should_handover: true,
            immediate: true,
            reason: "explicit_request",
            confidence: 1.0,
            message: "Connecting you with a human agent now.".to_string(),
        });
    }

    if matches_any(&ASSISTED_PATTERNS, current_message) {
        let immediate = has_identity(collected_entities);
        return Some(HandoverVerdict {
            should_handover: true,
            immediate,
            reason: "assisted_issue",
            confidence: 0.85,
            message: "I can get a specialist to help with that.".to_string(),
        });
    }

    if matches_any(&FRUSTRATION_PATTERNS, current_message) {
        let immediate = has_identity(collected_entities);
        return Some(HandoverVerdict {
            should_handover: true,
            immediate,
            reason: "frustration_detected",
            confidence: 0.9,
            message: "I understand this is frustrating — let me get you a human agent.".to_string(),
        });
    }

    if let Some(verdict) = detect_repetitive_questions(current_message, history, config) {
        return Some(verdict);
    }

    if let Some(verdict) = detect_prolonged_back_and_forth(history, config) {
        return Some(verdict);
    }

    detect_low_ai_confidence(history, config)
}

/// Rule 4: over the last <=5 customer messages, at least
/// `max_similar_questions` pairs are >= `similarity_threshold` Jaccard
/// similar to the newest customer message.
fn detect_repetitive_questions(
    current_message: &str,
    history: &[Message],
    config: &HandoverConfig,
) -> Option<HandoverVerdict> {
    let recent_customer: Vec<&str> = history
        .iter()
        .rev()
        .filter(|m| m.sender_type == SenderType::Customer.as_str())
        .take(5)
        .map(|m| m.content.as_str())
        .collect();

    let similar_count = recent_customer
        .iter()
        .filter(|msg| jaccard_similarity(current_message, msg) >= config.similarity_threshold)
        .count();

    if similar_count >= config.max_similar_questions {
        return Some(HandoverVerdict {
            should_handover: true,
            immediate: false,
            reason: "repetitive_questions",
            confidence: 0.8,
            message: "Let me connect you with someone who can dig into this further.".to_string(),
        });
    }
    None
}

/// Rule 5: >= max_back_and_forth exchanges in the tail, with >=3 AI
/// responses under `short_response_chars`.
fn detect_prolonged_back_and_forth(history: &[Message], config: &HandoverConfig) -> Option<HandoverVerdict> {
    let tail: Vec<&Message> = history.iter().rev().take(config.max_back_and_forth * 2).collect();
    if tail.len() < config.max_back_and_forth {
        return None;
    }

    let short_ai_responses = tail
        .iter()
        .filter(|m| m.sender_type == SenderType::Ai.as_str() && m.content.len() < config.short_response_chars)
        .count();

    if short_ai_responses >= 3 {
        return Some(HandoverVerdict {
            should_handover: true,
            immediate: false,
            reason: "prolonged_back_and_forth",
            confidence: 0.75,
            message: "This is taking a while — let's bring in a human agent.".to_string(),
        });
    }
    None
}

/// Rule 6: two consecutive AI responses with `metadata.confidence` below
/// `low_confidence_threshold`.
fn detect_low_ai_confidence(history: &[Message], config: &HandoverConfig) -> Option<HandoverVerdict> {
    let ai_confidences: Vec<f32> = history
        .iter()
        .rev()
        .filter(|m| m.sender_type == SenderType::Ai.as_str())
        .take(2)
        .filter_map(|m| {
            m.metadata.as_ref().and_then(|meta| meta.get("confidence")).and_then(|v| v.as_f64()).map(|c| c as f32)
        })
        .collect();

    if ai_confidences.len() == 2 && ai_confidences.iter().all(|&c| c < config.low_confidence_threshold) {
        return Some(HandoverVerdict {
            should_handover: true,
            immediate: false,
            reason: "low_ai_confidence",
            confidence: 0.7,
            message: "Let me find someone who can help with more confidence.".to_string(),
        });
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn msg(sender: SenderType, content: &str) -> Message {
        Message {
            message_id: 0,
            room_id: 1,
            tenant_id: "acme".to_string(),
            sender_type: sender.as_str().to_string(),
            content: content.to_string(),
            metadata: None,
            created_at: Utc::now(),
            sender_id: None,
        }
    }

    #[test]
    fn explicit_request_is_immediate() {
        let verdict = detect("I want to speak to a human agent", &[], &HashMap::new(), &HandoverConfig::default());
        let verdict = verdict.unwrap();
        assert!(verdict.immediate);
        assert_eq!(verdict.reason, "explicit_request");
        assert_eq!(verdict.confidence, 1.0);
    }

    #[test]
    fn assisted_without_identity_is_not_immediate() {
        let verdict = detect("My payment failed", &[], &HashMap::new(), &HandoverConfig::default()).unwrap();
        assert!(!verdict.immediate);
        assert_eq!(verdict.reason, "assisted_issue");
    }

    #[test]
    fn assisted_with_identity_promotes_to_immediate() {
        let mut entities = HashMap::new();
        entities.insert("email".to_string(), Json::String("jane@x.co".to_string()));
        let verdict = detect("My payment failed", &[], &entities, &HandoverConfig::default()).unwrap();
        assert!(verdict.immediate);
    }

    #[test]
    fn repetitive_questions_trigger_escalation() {
        // Three prior customer turns, each >=0.7 Jaccard-similar to the
        // newest message ({where,is,my,order} / {where,is,my,order,now} =
        // 0.8), meeting `max_similar_questions` (3).
        let history = vec![
            msg(SenderType::Customer, "where is my order"),
            msg(SenderType::Ai, "let me check"),
            msg(SenderType::Customer, "where is my order"),
            msg(SenderType::Ai, "still checking"),
            msg(SenderType::Customer, "where is my order"),
            msg(SenderType::Ai, "almost done"),
        ];
        let verdict = detect("where is my order now", &history, &HashMap::new(), &HandoverConfig::default());
        assert_eq!(verdict.unwrap().reason, "repetitive_questions");
    }

    #[test]
    fn unrelated_message_yields_no_verdict() {
        assert!(detect("what is your refund window?", &[], &HashMap::new(), &HandoverConfig::default()).is_none());
    }

    #[test]
    fn deterministic_on_fixed_input() {
        let a = detect("I need a manager", &[], &HashMap::new(), &HandoverConfig::default());
        let b = detect("I need a manager", &[], &HashMap::new(), &HandoverConfig::default());
        assert_eq!(a, b);
    }
}
