use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use axum::Router;
use axum::body::{Body, Bytes, to_bytes};
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, Request, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::Instrument;

use super::GatewayError;
use super::auth::{AuthGate, Claims, TokenVersionStore};
use super::broadcast::{ChatFanout, MessageBroker};
use super::config::{GatewayConfig, PaginationConfig, RateLimitConfigCache};
use super::envelope::{self, ApiError};
use super::history::{ContextAssembler, ContextStage};
use super::ids::IdGenerator;
use super::limits::{QuotaLedger, QuotaStage, QuotaStore};
use super::pipeline::{CallContext, Pipeline};
use super::relay::{RelayMode, StreamRelay};
use super::sqlite_store::{SqliteStore, SqliteStoreError};
use super::store_types::{ConversationRecord, MessageRecord};
use super::usage::{UsageRecorder, parse_date};

static REQUEST_ID_SEQ: AtomicU64 = AtomicU64::new(0);

/// Storage collaborators the HTTP state is assembled from.
pub struct GatewayBackends {
    pub sqlite: SqliteStore,
    pub quota: Arc<dyn QuotaStore>,
    pub token_versions: Arc<dyn TokenVersionStore>,
    pub broker: Arc<dyn MessageBroker>,
}

#[derive(Clone)]
pub struct GatewayHttpState {
    auth: Arc<AuthGate>,
    chat: Pipeline,
    proxy: Pipeline,
    store: SqliteStore,
    usage: Arc<UsageRecorder>,
    fanout: Arc<ChatFanout>,
    rate_limits: Arc<RateLimitConfigCache>,
    pagination: PaginationConfig,
    max_body_bytes: usize,
}

impl GatewayHttpState {
    pub fn new(config: &GatewayConfig, backends: GatewayBackends) -> Result<Self, GatewayError> {
        let secret = config.auth.resolve_secret()?;
        let relay = StreamRelay::new(&config.backend).map_err(|err| GatewayError::Backend {
            message: err.to_string(),
        })?;
        let ids = Arc::new(IdGenerator::new(config.node_id));
        let rate_limits = Arc::new(RateLimitConfigCache::from_config(config.rate_limit.clone()));

        let auth = Arc::new(AuthGate::new(
            secret.into_bytes(),
            backends.token_versions,
            config.auth.login_device_max,
        ));
        let ledger = Arc::new(QuotaLedger::new(Arc::clone(&rate_limits), backends.quota));
        let context = Arc::new(ContextStage::new(Arc::new(ContextAssembler::new(
            backends.sqlite.clone(),
            Arc::clone(&ids),
            config.history.effective_max_messages(),
        ))));
        let usage = Arc::new(UsageRecorder::new(backends.sqlite.clone(), Arc::clone(&ids)));
        let fanout = Arc::new(ChatFanout::new(
            backends.broker,
            Some(backends.sqlite.clone()),
            Arc::clone(&ids),
            config.chat_ws.publish_key.clone(),
        ));

        let chat = Pipeline::new(relay.clone(), RelayMode::Chat)
            .with_stage(auth.clone())
            .with_stage(Arc::new(QuotaStage::new(ledger)))
            .with_stage(context.clone())
            .with_post_stage(context)
            .with_post_stage(usage.clone());
        let proxy = Pipeline::new(relay, RelayMode::Passthrough)
            .with_stage(auth.clone())
            .with_post_stage(usage.clone());

        Ok(Self {
            auth,
            chat,
            proxy,
            store: backends.sqlite,
            usage,
            fanout,
            rate_limits,
            pagination: config.conversations.clone(),
            max_body_bytes: config.proxy_max_body_bytes,
        })
    }

    /// Live rate-limit settings; `replace` on the returned cache takes effect
    /// on the next call.
    pub fn rate_limits(&self) -> Arc<RateLimitConfigCache> {
        Arc::clone(&self.rate_limits)
    }

    pub fn auth(&self) -> &AuthGate {
        &self.auth
    }
}

pub fn router(state: GatewayHttpState) -> Router {
    Router::new()
        .route("/v1/chat/completions", any(handle_chat_completions))
        .route("/v1/conversations", get(handle_list_conversations))
        .route(
            "/v1/conversations/:conversation_id/messages",
            get(handle_list_conversation_messages),
        )
        .route("/v1/*path", any(handle_proxy))
        .route("/usage/total", post(handle_usage_total))
        .route("/usage/stats", post(handle_usage_stats))
        .route("/chat/ws", get(handle_chat_ws))
        .with_state(state)
}

fn extract_header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn generate_request_id() -> String {
    let seq = REQUEST_ID_SEQ.fetch_add(1, Ordering::Relaxed);
    let ts_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis())
        .unwrap_or(0);
    format!("ditto-{ts_ms}-{seq}")
}

fn insert_request_id(headers: &mut HeaderMap, request_id: &str) {
    let value = match axum::http::HeaderValue::from_str(request_id) {
        Ok(value) => value,
        Err(_) => return,
    };
    headers.insert("x-request-id", value);
}

fn format_timestamp_ms(ms: i64) -> String {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(ms) * 1_000_000)
        .ok()
        .and_then(|at| at.format(&Rfc3339).ok())
        .unwrap_or_default()
}

/// Authenticates a non-pipeline request with the same rules as the pipeline.
async fn authenticate(state: &GatewayHttpState, headers: &HeaderMap, uri: &Uri) -> Result<Claims, ApiError> {
    state
        .auth
        .authenticate(headers, uri)
        .await
        .map_err(|err| err.to_api_error())
}

fn store_error(err: SqliteStoreError) -> ApiError {
    tracing::error!(error = %err, "store query failed");
    ApiError::database("database error")
}

/// Runs one call through `pipeline` inside a request span.
async fn run_pipeline(state: &GatewayHttpState, pipeline: &Pipeline, req: Request<Body>) -> Response {
    let (parts, incoming_body) = req.into_parts();
    let request_id =
        extract_header(&parts.headers, "x-request-id").unwrap_or_else(generate_request_id);
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| parts.uri.path().to_string());

    let span = match pipeline.mode() {
        RelayMode::Chat => tracing::info_span!(
            "ditto.gateway.chat",
            request_id = %request_id,
            method = %parts.method,
            path = %parts.uri.path(),
            user_id = tracing::field::Empty,
            conversation_id = tracing::field::Empty,
            model = tracing::field::Empty,
            status = tracing::field::Empty,
        ),
        RelayMode::Passthrough => tracing::info_span!(
            "ditto.gateway.proxy",
            request_id = %request_id,
            method = %parts.method,
            path = %parts.uri.path(),
            user_id = tracing::field::Empty,
            conversation_id = tracing::field::Empty,
            model = tracing::field::Empty,
            status = tracing::field::Empty,
        ),
    };

    async move {
        let body = match to_bytes(incoming_body, state.max_body_bytes).await {
            Ok(body) => body,
            Err(err) => {
                let mut response = ApiError::invalid_param("failed to read request body")
                    .with_details(err)
                    .into_response();
                insert_request_id(response.headers_mut(), &request_id);
                return response;
            }
        };

        let ctx = CallContext::new(
            request_id.clone(),
            parts.method,
            path_and_query,
            parts.headers,
            body,
        );
        let mut response = pipeline.handle(ctx).await;
        tracing::Span::current().record("status", response.status().as_u16());
        insert_request_id(response.headers_mut(), &request_id);
        response
    }
    .instrument(span)
    .await
}
