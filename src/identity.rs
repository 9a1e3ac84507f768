//! Conversation fingerprinting.
//!
//! The fingerprint groups requests into one conversation. The client's
//! `metadata.user_id` carries a stable session identifier of the form
//! `user_{hash}_account_{uuid}_session_{uuid}`; the trailing session UUID is
//! unique per conversation and stable across reconnects. When metadata is
//! absent, the fallback hashes the system prompt prefix plus the first user
//! message. Only the prefix participates, since the tail of the system
//! prompt may change between requests.

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::wire::MessagesRequest;

/// How many characters of the system prompt participate in the fallback
/// fingerprint.
const SYSTEM_PREFIX_LENGTH: usize = 1000;

/// Compute the conversation fingerprint for a request.
#[must_use]
pub fn compute_fingerprint(request: &MessagesRequest) -> String {
    if let Some(session) = extract_session_id(request) {
        return session;
    }
    fallback_fingerprint(request)
}

/// Derive the short human-readable conversation id from a fingerprint.
#[must_use]
pub fn short_id(fingerprint: &str) -> String {
    fingerprint.chars().take(16).collect()
}

fn extract_session_id(request: &MessagesRequest) -> Option<String> {
    let user_id = request
        .metadata
        .as_ref()?
        .get("user_id")?
        .as_str()?;
    let (_, session) = user_id.rsplit_once("_session_")?;
    if session.is_empty() || !session.chars().all(|c| c.is_ascii_hexdigit() || c == '-') {
        return None;
    }
    Some(session.to_string())
}

fn fallback_fingerprint(request: &MessagesRequest) -> String {
    let mut parts: Vec<String> = Vec::new();

    match &request.system {
        Some(Value::String(system)) => {
            parts.push(truncate_chars(system, SYSTEM_PREFIX_LENGTH));
        }
        Some(system @ Value::Array(_)) => {
            let serialized = serde_json::to_string(system).unwrap_or_default();
            parts.push(truncate_chars(&serialized, SYSTEM_PREFIX_LENGTH));
        }
        _ => {}
    }

    if let Some(first_user) = request
        .messages
        .iter()
        .find(|message| crate::wire::message_role(message) == "user")
    {
        match first_user.get("content") {
            Some(Value::String(content)) => parts.push(content.clone()),
            Some(content @ Value::Array(_)) => {
                parts.push(serde_json::to_string(content).unwrap_or_default());
            }
            _ => {}
        }
    }

    let combined = parts.join("\n---\n");
    let digest = Sha256::digest(combined.as_bytes());
    digest.iter().map(|byte| format!("{byte:02x}")).collect()
}

fn truncate_chars(text: &str, limit: usize) -> String {
    text.chars().take(limit).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(body: Value) -> MessagesRequest {
        serde_json::from_value(body).unwrap()
    }

    #[test]
    fn test_session_id_preferred() {
        let req = request(json!({
            "model": "m",
            "metadata": {"user_id": "user_abc_account_11111111_session_deadbeef-1234"},
            "messages": [{"role": "user", "content": "hello"}],
        }));
        assert_eq!(compute_fingerprint(&req), "deadbeef-1234");
    }

    #[test]
    fn test_malformed_user_id_falls_back_to_hash() {
        let req = request(json!({
            "model": "m",
            "metadata": {"user_id": "user_abc_session_NOT HEX!"},
            "system": "You are a helpful assistant.",
            "messages": [{"role": "user", "content": "hello"}],
        }));
        let fp = compute_fingerprint(&req);
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_fallback_is_deterministic_and_discriminating() {
        let a = request(json!({
            "model": "m",
            "system": "shared system prompt",
            "messages": [{"role": "user", "content": "first question"}],
        }));
        let b = request(json!({
            "model": "m",
            "system": "shared system prompt",
            "messages": [{"role": "user", "content": "different question"}],
        }));
        assert_eq!(compute_fingerprint(&a), compute_fingerprint(&a));
        assert_ne!(compute_fingerprint(&a), compute_fingerprint(&b));
    }

    #[test]
    fn test_fallback_stable_across_appended_messages() {
        let first = request(json!({
            "model": "m",
            "system": "system prompt",
            "messages": [{"role": "user", "content": "opening"}],
        }));
        let later = request(json!({
            "model": "m",
            "system": "system prompt",
            "messages": [
                {"role": "user", "content": "opening"},
                {"role": "assistant", "content": "reply"},
                {"role": "user", "content": "followup"},
            ],
        }));
        assert_eq!(compute_fingerprint(&first), compute_fingerprint(&later));
    }

    #[test]
    fn test_short_id() {
        assert_eq!(short_id("0123456789abcdef0123"), "0123456789abcdef");
        assert_eq!(short_id("short"), "short");
    }
}
