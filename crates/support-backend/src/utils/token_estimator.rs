//! Token counting fallback when a provider doesn't report usage:
//! `ceil(len / 4)`. Shared by the LLM Gateway's
//! `TokenUsage::estimate` and prompt-budget checks in the Query Core.

pub fn estimate_tokens(text: &str) -> usize {
    ((text.len() as f64) / 4.0).ceil() as usize
}

pub fn would_exceed_limit(current_tokens: usize, new_text: &str, max_tokens: usize) -> bool {
    current_tokens + estimate_tokens(new_text) > max_tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_string_is_zero_tokens() {
        assert_eq!(estimate_tokens(""), 0);
    }

    #[test]
    fn rounds_up_to_whole_tokens() {
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn exceeding_budget_is_detected() {
        let text = "x".repeat(400);
        assert!(would_exceed_limit(900, &text, 1000));
        assert!(!would_exceed_limit(500, &text, 1000));
    }
}
