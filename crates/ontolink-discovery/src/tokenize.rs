//! Deterministic tokenization for property values and queries.
//!
//! Rules (kept simple and name-aware):
//! - Split on non-alphanumeric characters (including `_` and `.`).
//! - Split camelCase/PascalCase boundaries (PaymentService → payment + service).
//! - Lowercase everything.
//! - Ignore very short tokens and common stopwords.
//!
//! Queries additionally carry per-token weights: the triggering value is
//! boosted over the property name, which is boosted over context tokens.

const MIN_TOKEN_LEN: usize = 2;
const MAX_TOKEN_LEN: usize = 64;
const STOPWORDS: &[&str] = &[
    "a", "an", "and", "as", "at", "by", "for", "in", "is", "of", "on", "or", "the", "to", "with",
];

pub fn tokenize(text: &str) -> Vec<String> {
    let mut tokens: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut prev_was_lower = false;

    for c in text.chars() {
        if c.is_ascii_alphanumeric() {
            if c.is_ascii_uppercase() && prev_was_lower && !current.is_empty() {
                push_token(&mut tokens, &mut current);
            }
            let lc = c.to_ascii_lowercase();
            if current.len() < MAX_TOKEN_LEN {
                current.push(lc);
            }
            prev_was_lower = lc.is_ascii_lowercase();
            continue;
        }
        if !current.is_empty() {
            push_token(&mut tokens, &mut current);
        }
        prev_was_lower = false;
    }
    if !current.is_empty() {
        push_token(&mut tokens, &mut current);
    }
    tokens
}

fn push_token(tokens: &mut Vec<String>, current: &mut String) {
    if current.len() >= MIN_TOKEN_LEN && !STOPWORDS.contains(&current.as_str()) {
        tokens.push(std::mem::take(current));
    } else {
        current.clear();
    }
}

/// Tokens a property value contributes to a document: the raw value string
/// (lowercased, so "user-123" is searchable as a unit) plus its word-level
/// tokens.
pub fn document_tokens(raw_value: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let raw = raw_value.trim().to_ascii_lowercase();
    if raw.len() >= MIN_TOKEN_LEN && raw.len() <= MAX_TOKEN_LEN {
        tokens.push(raw);
    }
    for token in tokenize(raw_value) {
        if tokens.first() != Some(&token) {
            tokens.push(token);
        }
    }
    tokens
}

/// Append `document_tokens(text)` to a weighted token list.
pub fn push_weighted(tokens: &mut Vec<(String, u32)>, text: &str, weight: u32) {
    for token in document_tokens(text) {
        if let Some(existing) = tokens.iter_mut().find(|(t, _)| *t == token) {
            existing.1 = existing.1.max(weight);
        } else {
            tokens.push((token, weight));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn camel_case_splits() {
        assert_eq!(tokenize("PaymentService"), vec!["payment", "service"]);
    }

    #[test]
    fn stopwords_and_short_tokens_drop() {
        assert_eq!(tokenize("the id of a user"), vec!["id", "user"]);
    }

    #[test]
    fn document_tokens_keep_the_raw_value() {
        let tokens = document_tokens("user-123");
        assert_eq!(tokens[0], "user-123");
        assert!(tokens.contains(&"user".to_string()));
        assert!(tokens.contains(&"123".to_string()));
    }

    #[test]
    fn weights_keep_the_strongest_boost() {
        let mut tokens = Vec::new();
        push_weighted(&mut tokens, "alpha", 1);
        push_weighted(&mut tokens, "alpha", 3);
        assert_eq!(tokens, vec![("alpha".to_string(), 3)]);
    }
}
