//! Conversation lifecycle around a chat call: resolve or create the
//! conversation, merge stored history into the outgoing request, and persist
//! both sides of the turn.

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::{HeaderValue, Method};
use serde_json::{Map, Value};
use thiserror::Error;

use super::chat_payload::{ChatMessage, ConversationOptions, PayloadError, parse_messages};
use super::envelope::ApiError;
use super::ids::IdGenerator;
use super::pipeline::{CallContext, CapturedResponse, PostStage, Stage, StageOutcome};
use super::sniffer::extract_assistant_text;
use super::sqlite_store::{SqliteStore, SqliteStoreError};
use super::store_types::{MessageRecord, NewConversation, NewMessage};
use super::{Clock, SystemClock};

pub const CONVERSATION_ID_HEADER: &str = "x-conversation-id";
pub const CHAT_COMPLETIONS_PATH: &str = "/v1/chat/completions";
pub const TITLE_MAX_RUNES: usize = 30;
pub const PLACEHOLDER_TITLE: &str = "New chat";

#[derive(Debug, Error)]
pub enum ContextError {
    #[error(transparent)]
    Payload(#[from] PayloadError),
    #[error("a continued conversation accepts one user message, or one system message followed by one user message")]
    ContinuationShape,
    #[error("conversation not found")]
    ConversationNotFound,
    #[error("conversation store error: {0}")]
    Store(#[from] SqliteStoreError),
    #[error("failed to serialize message: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl ContextError {
    pub fn to_api_error(&self) -> ApiError {
        match self {
            Self::Payload(_) | Self::ContinuationShape => ApiError::invalid_param(self.to_string()),
            Self::ConversationNotFound => ApiError::not_found(self.to_string()),
            Self::Store(_) => ApiError::database("conversation store unavailable"),
            Self::Serialize(_) => ApiError::internal("failed to rewrite request"),
        }
    }
}

/// The rewritten request body and the conversation it belongs to.
#[derive(Clone, Debug)]
pub struct PreparedRequest {
    pub payload: Map<String, Value>,
    pub conversation_id: i64,
    pub is_new_conversation: bool,
    pub model: String,
}

pub struct ContextAssembler {
    store: SqliteStore,
    ids: Arc<IdGenerator>,
    clock: Arc<dyn Clock>,
    max_history: usize,
}

impl ContextAssembler {
    pub fn new(store: SqliteStore, ids: Arc<IdGenerator>, max_history: usize) -> Self {
        Self::with_clock(store, ids, max_history, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: SqliteStore,
        ids: Arc<IdGenerator>,
        max_history: usize,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            ids,
            clock,
            max_history,
        }
    }

    pub fn store(&self) -> &SqliteStore {
        &self.store
    }

    fn now_ms(&self) -> i64 {
        i64::try_from(self.clock.now_millis()).unwrap_or(i64::MAX)
    }

    pub async fn prepare_request(
        &self,
        user_id: i64,
        mut payload: Map<String, Value>,
    ) -> Result<PreparedRequest, ContextError> {
        let model = payload
            .get("model")
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or_default()
            .to_string();
        let current = parse_messages(&payload)?;
        let options = ConversationOptions::consume(&mut payload)?;

        let (conversation_id, is_new_conversation) = match options.conversation_id {
            Some(conversation_id) if options.is_continuation() => {
                if !self
                    .store
                    .conversation_belongs_to_user(conversation_id, user_id)
                    .await?
                {
                    return Err(ContextError::ConversationNotFound);
                }
                validate_continuation(&current)?;
                (conversation_id, false)
            }
            _ => {
                let conversation = self
                    .store
                    .create_conversation(NewConversation {
                        id: self.ids.next_id(),
                        user_id,
                        title: conversation_title(&current),
                        model: model.clone(),
                        created_at_ms: self.now_ms(),
                    })
                    .await?;
                (conversation.id, true)
            }
        };

        let merged = if is_new_conversation {
            current
                .iter()
                .map(|message| Value::Object(message.raw.clone()))
                .collect()
        } else {
            let stored_system = self.store.latest_system_message(conversation_id).await?;
            let history = self
                .store
                .recent_history(conversation_id, self.max_history)
                .await?;
            merge_messages(stored_system.as_ref(), &history, &current)
        };
        payload.insert("messages".to_string(), Value::Array(merged));

        self.persist_turn(user_id, conversation_id, &model, &current)
            .await?;

        Ok(PreparedRequest {
            payload,
            conversation_id,
            is_new_conversation,
            model,
        })
    }

    async fn persist_turn(
        &self,
        user_id: i64,
        conversation_id: i64,
        model: &str,
        current: &[ChatMessage],
    ) -> Result<(), ContextError> {
        let now_ms = self.now_ms();
        // Ids follow request order: the system slot comes before the user turn.
        let system = match current.iter().rev().find(|message| message.is_system()) {
            Some(system) => Some(self.new_message(user_id, conversation_id, model, system, now_ms)?),
            None => None,
        };
        let mut users = Vec::new();
        for message in current.iter().filter(|message| message.is_user()) {
            users.push(self.new_message(user_id, conversation_id, model, message, now_ms)?);
        }
        if let Some(system) = system {
            self.store.upsert_system_message(system).await?;
        }
        self.store.insert_messages(users).await?;
        self.store
            .refresh_conversation_stats(conversation_id, Some(model.to_string()), now_ms)
            .await?;
        Ok(())
    }

    fn new_message(
        &self,
        user_id: i64,
        conversation_id: i64,
        model: &str,
        message: &ChatMessage,
        now_ms: i64,
    ) -> Result<NewMessage, ContextError> {
        Ok(NewMessage {
            id: self.ids.next_id(),
            conversation_id,
            user_id,
            role: message.role.clone(),
            content: message.content.clone(),
            message_json: Some(serde_json::to_string(&message.raw)?),
            model: model.to_string(),
            created_at_ms: now_ms,
        })
    }

    /// Persists the assistant reply (when there is one) and refreshes stats.
    pub async fn finalize_response(
        &self,
        conversation_id: i64,
        user_id: i64,
        model: &str,
        assistant_text: Option<&str>,
    ) -> Result<(), ContextError> {
        let now_ms = self.now_ms();
        let mut save_result = Ok(());
        if let Some(text) = assistant_text.filter(|text| !text.trim().is_empty()) {
            let raw = serde_json::json!({"role": "assistant", "content": text});
            let message = NewMessage {
                id: self.ids.next_id(),
                conversation_id,
                user_id,
                role: "assistant".to_string(),
                content: text.to_string(),
                message_json: Some(raw.to_string()),
                model: model.to_string(),
                created_at_ms: now_ms,
            };
            save_result = self.store.insert_messages(vec![message]).await;
        }
        self.store
            .refresh_conversation_stats(conversation_id, Some(model.to_string()), now_ms)
            .await?;
        save_result.map_err(ContextError::from)
    }
}

/// `[user]` or `[system, user]`, nothing else.
pub fn validate_continuation(messages: &[ChatMessage]) -> Result<(), ContextError> {
    match messages {
        [only] if only.is_user() => Ok(()),
        [first, second] if first.is_system() && second.is_user() => Ok(()),
        _ => Err(ContextError::ContinuationShape),
    }
}

/// Builds `[system?, history..., current...]`.
///
/// A system message in the current turn takes the system slot over the stored
/// one; otherwise the stored system message is replayed.
pub fn merge_messages(
    stored_system: Option<&MessageRecord>,
    history: &[MessageRecord],
    current: &[ChatMessage],
) -> Vec<Value> {
    let mut merged = Vec::with_capacity(history.len() + current.len() + 1);
    let current_system = current.iter().rev().find(|message| message.is_system());
    match (current_system, stored_system) {
        (Some(system), _) => merged.push(Value::Object(system.raw.clone())),
        (None, Some(stored)) => merged.push(replay_message(stored)),
        (None, None) => {}
    }
    merged.extend(
        history
            .iter()
            .filter(|record| record.role != "system")
            .map(replay_message),
    );
    merged.extend(
        current
            .iter()
            .filter(|message| !message.is_system())
            .map(|message| Value::Object(message.raw.clone())),
    );
    merged
}

fn replay_message(record: &MessageRecord) -> Value {
    let replayed = record
        .message_json
        .as_deref()
        .filter(|raw| !raw.trim().is_empty())
        .and_then(|raw| serde_json::from_str::<Value>(raw).ok())
        .filter(Value::is_object);
    replayed.unwrap_or_else(|| serde_json::json!({"role": record.role, "content": record.content}))
}

pub fn conversation_title(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .filter(|message| message.is_user())
        .map(|message| message.content.trim())
        .find(|text| !text.is_empty())
        .map(|text| truncate_runes(text, TITLE_MAX_RUNES))
        .unwrap_or_else(|| PLACEHOLDER_TITLE.to_string())
}

pub fn truncate_runes(text: &str, limit: usize) -> String {
    text.chars().take(limit).collect()
}

fn is_chat_completion(ctx: &CallContext) -> bool {
    ctx.method == Method::POST && ctx.path == CHAT_COMPLETIONS_PATH
}

/// Pre-stage: rewrites the body with history and persists the user turn.
pub struct ContextStage {
    assembler: Arc<ContextAssembler>,
}

impl ContextStage {
    pub fn new(assembler: Arc<ContextAssembler>) -> Self {
        Self { assembler }
    }
}

#[async_trait]
impl Stage for ContextStage {
    fn name(&self) -> &'static str {
        "context"
    }

    async fn run(&self, ctx: &mut CallContext) -> StageOutcome {
        if !is_chat_completion(ctx) {
            return StageOutcome::Continue;
        }
        let Some(user_id) = ctx.user_id.filter(|id| *id > 0) else {
            return ApiError::unauthorized("token is invalid or expired").into();
        };
        let payload = match ctx.json_body() {
            Ok(payload) => payload,
            Err(err) => return err.into(),
        };

        let prepared = match self.assembler.prepare_request(user_id, payload).await {
            Ok(prepared) => prepared,
            Err(err) => {
                if matches!(err, ContextError::Store(_)) {
                    tracing::error!(request_id = %ctx.request_id, user_id, error = %err, "conversation lookup failed");
                }
                return err.to_api_error().into();
            }
        };
        if let Err(err) = ctx.set_json_body(&prepared.payload) {
            return err.into();
        }

        ctx.conversation_id = Some(prepared.conversation_id);
        ctx.is_new_conversation = prepared.is_new_conversation;
        if !prepared.model.is_empty() {
            tracing::Span::current().record("model", prepared.model.as_str());
            ctx.model = Some(prepared.model);
        }
        ctx.response_headers.insert(
            CONVERSATION_ID_HEADER,
            HeaderValue::from(prepared.conversation_id),
        );
        tracing::Span::current().record("conversation_id", prepared.conversation_id);
        StageOutcome::Continue
    }
}

#[async_trait]
impl PostStage for ContextStage {
    fn name(&self) -> &'static str {
        "context"
    }

    async fn finish(&self, ctx: &CallContext, response: &CapturedResponse) {
        let (Some(conversation_id), Some(user_id)) = (ctx.conversation_id, ctx.user_id) else {
            return;
        };

        let (text, parsed_model) = extract_assistant_text(&response.body);
        let model = parsed_model
            .or_else(|| ctx.model.clone())
            .unwrap_or_default();
        let assistant_text = response
            .status
            .is_success()
            .then_some(text.as_str());

        if let Err(err) = self
            .assembler
            .finalize_response(conversation_id, user_id, &model, assistant_text)
            .await
        {
            tracing::error!(
                request_id = %ctx.request_id,
                conversation_id,
                user_id,
                error = %err,
                "failed to persist assistant turn"
            );
        }
    }
}
