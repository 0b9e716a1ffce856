//! Typed view over the loosely-shaped `chat/completions` request body.

use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PayloadError {
    #[error("request body must be a json object")]
    NotJsonObject,
    #[error("messages must be a non-empty array")]
    EmptyMessages,
    #[error("every item in messages must be an object")]
    MessageNotObject,
    #[error("messages.role must be a non-empty string")]
    InvalidRole,
    #[error("messages.content only supports plain text strings")]
    UnsupportedContent,
    #[error("new_chat must be a boolean")]
    InvalidNewChat,
    #[error("conversation_id must be a positive integer")]
    InvalidConversationId,
}

/// The content shapes a chat message may carry.
#[derive(Clone, Debug, PartialEq)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<MessageContent>),
    /// An object part; holds its `text` field, else its `content` field, when string-typed.
    Object(Option<String>),
    Unsupported,
}

impl MessageContent {
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::String(text) => Self::Text(text.clone()),
            Value::Array(items) => Self::Parts(items.iter().map(Self::from_value).collect()),
            Value::Object(obj) => {
                let text = obj
                    .get("text")
                    .and_then(Value::as_str)
                    .or_else(|| obj.get("content").and_then(Value::as_str));
                Self::Object(text.map(str::to_string))
            }
            _ => Self::Unsupported,
        }
    }

    /// UTF-8 byte length of all textual fragments.
    pub fn text_bytes(&self) -> usize {
        match self {
            Self::Text(text) => text.len(),
            Self::Parts(parts) => parts.iter().map(Self::text_bytes).sum(),
            Self::Object(text) => text.as_deref().map(str::len).unwrap_or(0),
            Self::Unsupported => 0,
        }
    }
}

/// A validated, text-only message from the current turn.
#[derive(Clone, Debug, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
    /// The message object as it is forwarded and replayed, with normalized role.
    pub raw: Map<String, Value>,
}

impl ChatMessage {
    pub fn is_system(&self) -> bool {
        self.role == "system"
    }

    pub fn is_user(&self) -> bool {
        self.role == "user"
    }
}

pub fn parse_messages(payload: &Map<String, Value>) -> Result<Vec<ChatMessage>, PayloadError> {
    let items = match payload.get("messages") {
        Some(Value::Array(items)) if !items.is_empty() => items,
        _ => return Err(PayloadError::EmptyMessages),
    };

    let mut messages = Vec::with_capacity(items.len());
    for item in items {
        let Value::Object(obj) = item else {
            return Err(PayloadError::MessageNotObject);
        };
        let role = obj
            .get("role")
            .and_then(Value::as_str)
            .map(|role| role.trim().to_ascii_lowercase())
            .filter(|role| !role.is_empty())
            .ok_or(PayloadError::InvalidRole)?;
        let content = match MessageContent::from_value(obj.get("content").unwrap_or(&Value::Null))
        {
            MessageContent::Text(text) => text,
            _ => return Err(PayloadError::UnsupportedContent),
        };

        let mut raw = obj.clone();
        raw.insert("role".to_string(), Value::String(role.clone()));
        messages.push(ChatMessage { role, content, raw });
    }
    Ok(messages)
}

/// Gateway-private extension fields carried in the request body.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConversationOptions {
    pub conversation_id: Option<i64>,
    pub new_chat: bool,
}

impl ConversationOptions {
    /// Reads and removes `new_chat` and `conversation_id` from the payload.
    pub fn consume(payload: &mut Map<String, Value>) -> Result<Self, PayloadError> {
        let mut options = Self::default();
        if let Some(raw) = payload.remove("new_chat") {
            options.new_chat = parse_bool(&raw).ok_or(PayloadError::InvalidNewChat)?;
        }
        if let Some(raw) = payload.remove("conversation_id") {
            let id = parse_i64(&raw)
                .filter(|id| *id > 0)
                .ok_or(PayloadError::InvalidConversationId)?;
            options.conversation_id = Some(id);
        }
        Ok(options)
    }

    pub fn is_continuation(&self) -> bool {
        self.conversation_id.is_some() && !self.new_chat
    }
}

fn parse_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(flag) => Some(*flag),
        Value::String(raw) => match raw.trim() {
            "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
            "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

pub(crate) fn parse_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number.as_i64().or_else(|| {
            number
                .as_f64()
                .filter(|f| f.is_finite() && f.fract() == 0.0)
                .filter(|f| *f >= i64::MIN as f64 && *f <= i64::MAX as f64)
                .map(|f| f as i64)
        }),
        Value::String(raw) => raw.trim().parse::<i64>().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(obj) => obj,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn parse_messages_normalizes_role() {
        let payload = object(json!({
            "messages": [{"role": " User ", "content": "hi", "name": "bob"}]
        }));
        let messages = parse_messages(&payload).expect("messages");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, "user");
        assert_eq!(messages[0].raw.get("role"), Some(&json!("user")));
        assert_eq!(messages[0].raw.get("name"), Some(&json!("bob")));
    }

    #[test]
    fn parse_messages_rejects_multimodal_content() {
        let payload = object(json!({
            "messages": [{"role": "user", "content": [{"type": "text", "text": "hi"}]}]
        }));
        assert_eq!(
            parse_messages(&payload),
            Err(PayloadError::UnsupportedContent)
        );
    }

    #[test]
    fn parse_messages_rejects_bad_shapes() {
        assert_eq!(
            parse_messages(&object(json!({"messages": []}))),
            Err(PayloadError::EmptyMessages)
        );
        assert_eq!(
            parse_messages(&object(json!({"messages": ["hi"]}))),
            Err(PayloadError::MessageNotObject)
        );
        assert_eq!(
            parse_messages(&object(json!({"messages": [{"role": " ", "content": "x"}]}))),
            Err(PayloadError::InvalidRole)
        );
    }

    #[test]
    fn consume_strips_private_fields() {
        let mut payload = object(json!({
            "model": "m",
            "conversation_id": "42",
            "new_chat": "false",
        }));
        let options = ConversationOptions::consume(&mut payload).expect("options");
        assert_eq!(options.conversation_id, Some(42));
        assert!(!options.new_chat);
        assert!(options.is_continuation());
        assert!(!payload.contains_key("conversation_id"));
        assert!(!payload.contains_key("new_chat"));
    }

    #[test]
    fn consume_rejects_non_positive_ids() {
        let mut payload = object(json!({"conversation_id": 0}));
        assert_eq!(
            ConversationOptions::consume(&mut payload),
            Err(PayloadError::InvalidConversationId)
        );
        let mut payload = object(json!({"conversation_id": 1.5}));
        assert_eq!(
            ConversationOptions::consume(&mut payload),
            Err(PayloadError::InvalidConversationId)
        );
        let mut payload = object(json!({"new_chat": "maybe"}));
        assert_eq!(
            ConversationOptions::consume(&mut payload),
            Err(PayloadError::InvalidNewChat)
        );
    }

    #[test]
    fn new_chat_overrides_conversation_id() {
        let mut payload = object(json!({"conversation_id": 7.0, "new_chat": true}));
        let options = ConversationOptions::consume(&mut payload).expect("options");
        assert_eq!(options.conversation_id, Some(7));
        assert!(!options.is_continuation());
    }

    #[test]
    fn content_text_bytes_walks_known_shapes() {
        let content = MessageContent::from_value(&json!([
            {"type": "text", "text": "abc"},
            {"content": "de"},
            "f",
            [{"text": "gh"}],
            {"type": "image_url", "image_url": {"url": "x"}},
            42
        ]));
        assert_eq!(content.text_bytes(), 8);
    }
}
