use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub id: i64,
    pub user_id: i64,
    pub title: String,
    pub model: String,
    pub message_count: i64,
    pub last_message_preview: String,
    pub last_message_at_ms: i64,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

#[derive(Clone, Debug)]
pub struct NewConversation {
    pub id: i64,
    pub user_id: i64,
    pub title: String,
    pub model: String,
    pub created_at_ms: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: i64,
    pub conversation_id: i64,
    pub user_id: i64,
    pub role: String,
    pub content: String,
    /// Serialized original message object, replayed verbatim when present.
    pub message_json: Option<String>,
    pub model: String,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

#[derive(Clone, Debug)]
pub struct NewMessage {
    pub id: i64,
    pub conversation_id: i64,
    pub user_id: i64,
    pub role: String,
    pub content: String,
    pub message_json: Option<String>,
    pub model: String,
    pub created_at_ms: i64,
}

#[derive(Clone, Debug)]
pub struct ConversationPage {
    pub items: Vec<ConversationRecord>,
    pub total: u64,
}

#[derive(Clone, Debug)]
pub struct MessagePage {
    pub items: Vec<MessageRecord>,
    pub total: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub id: i64,
    pub user_id: i64,
    pub endpoint: String,
    pub method: String,
    pub status: u16,
    pub request_size: u64,
    pub response_size: u64,
    pub latency_ms: u64,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub error_message: Option<String>,
    pub created_at_ms: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageTotals {
    pub total_requests: u64,
    pub success_count: u64,
    pub fail_count: u64,
    pub total_tokens: u64,
    pub avg_latency_ms: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UsageEndpointDetail {
    pub endpoint: String,
    pub count: u64,
    pub total_tokens: u64,
    pub avg_latency_ms: f64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessageRecord {
    pub id: i64,
    pub from_id: i64,
    pub to_id: i64,
    pub message_type: Option<i64>,
    pub message_media: Option<i64>,
    pub content: String,
    pub created_at_ms: i64,
}
