//! Cheap prompt-size estimates used for quota charging. Not a tokenizer.

use serde_json::{Map, Value};

use super::chat_payload::MessageContent;

const BYTES_PER_TOKEN: u64 = 4;
const FALLBACK_MAX_TOKENS: u64 = 256;

/// Sums role and textual content bytes over `messages`, then divides by four rounding up.
pub fn estimate_prompt_tokens(payload: &Map<String, Value>) -> u64 {
    let Some(Value::Array(messages)) = payload.get("messages") else {
        return 0;
    };

    let total_bytes: u64 = messages
        .iter()
        .filter_map(Value::as_object)
        .map(|msg| {
            let role = msg.get("role").and_then(Value::as_str).map(str::len).unwrap_or(0);
            let content = msg
                .get("content")
                .map(|content| MessageContent::from_value(content).text_bytes())
                .unwrap_or(0);
            (role + content) as u64
        })
        .sum();

    total_bytes.div_ceil(BYTES_PER_TOKEN)
}

/// `max_tokens` from the request, or `fallback` when absent, negative or unparsable.
pub fn parse_max_tokens(payload: &Map<String, Value>, fallback: u64) -> u64 {
    let fallback = if fallback == 0 {
        FALLBACK_MAX_TOKENS
    } else {
        fallback
    };
    let Some(raw) = payload.get("max_tokens") else {
        return fallback;
    };

    let parsed = match raw {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().filter(|f| f.is_finite()).map(|f| f as i64)),
        Value::String(text) => {
            let text = text.trim();
            text.parse::<i64>()
                .ok()
                .or_else(|| text.parse::<f64>().ok().filter(|f| f.is_finite()).map(|f| f as i64))
        }
        _ => None,
    };

    match parsed {
        Some(value) if value >= 0 => value as u64,
        _ => fallback,
    }
}
