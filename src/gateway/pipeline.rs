//! Ordered request stages with abort semantics and a post-response phase.
//!
//! Pre-stages run strictly in order; the first `Abort` short-circuits the call
//! and its response is returned as-is. Otherwise the relay forwards the call and
//! post-stages run exactly once over the captured response body, after the
//! last byte reached the caller (or the caller went away).

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::body::{Body, to_bytes};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use futures_util::FutureExt;
use serde_json::{Map, Value};

use super::envelope::ApiError;
use super::relay::{CaptureSink, RelayMode, StreamRelay};

const MAX_ABORT_BODY_BYTES: usize = 1024 * 1024;

/// Per-call state threaded through the stages. Never shared across calls.
#[derive(Clone, Debug)]
pub struct CallContext {
    pub request_id: String,
    pub method: Method,
    pub path: String,
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub request_size: usize,
    pub started: Instant,
    pub user_id: Option<i64>,
    pub role: Option<String>,
    pub model: Option<String>,
    pub conversation_id: Option<i64>,
    pub is_new_conversation: bool,
    /// Extra headers applied to whatever response the call produces.
    pub response_headers: HeaderMap,
}

impl CallContext {
    pub fn new(
        request_id: impl Into<String>,
        method: Method,
        path_and_query: impl Into<String>,
        headers: HeaderMap,
        body: Bytes,
    ) -> Self {
        let path_and_query = path_and_query.into();
        let path = path_and_query
            .split_once('?')
            .map(|(path, _)| path)
            .unwrap_or(&path_and_query)
            .to_string();
        let request_size = body.len();
        Self {
            request_id: request_id.into(),
            method,
            path,
            path_and_query,
            headers,
            body,
            request_size,
            started: Instant::now(),
            user_id: None,
            role: None,
            model: None,
            conversation_id: None,
            is_new_conversation: false,
            response_headers: HeaderMap::new(),
        }
    }

    pub fn json_body(&self) -> Result<Map<String, Value>, ApiError> {
        match serde_json::from_slice::<Value>(&self.body) {
            Ok(Value::Object(obj)) => Ok(obj),
            Ok(_) => Err(ApiError::invalid_param("request body must be a json object")),
            Err(err) => Err(
                ApiError::invalid_param("request body must be a valid json object")
                    .with_details(err),
            ),
        }
    }

    pub fn set_json_body(&mut self, payload: &Map<String, Value>) -> Result<(), ApiError> {
        let raw = serde_json::to_vec(payload)
            .map_err(|err| ApiError::internal("failed to rewrite request").with_details(err))?;
        self.body = Bytes::from(raw);
        Ok(())
    }
}

pub enum StageOutcome {
    Continue,
    Abort(Response),
}

impl From<ApiError> for StageOutcome {
    fn from(err: ApiError) -> Self {
        Self::Abort(axum::response::IntoResponse::into_response(err))
    }
}

#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, ctx: &mut CallContext) -> StageOutcome;
}

/// What the caller received, as seen by post-stages.
#[derive(Clone, Debug)]
pub struct CapturedResponse {
    pub status: StatusCode,
    pub body: Bytes,
    pub latency: Duration,
    /// Set when the call never reached the relay.
    pub aborted: bool,
}

#[async_trait]
pub trait PostStage: Send + Sync {
    fn name(&self) -> &'static str;

    async fn finish(&self, ctx: &CallContext, response: &CapturedResponse);
}

#[derive(Clone)]
pub struct Pipeline {
    stages: Vec<Arc<dyn Stage>>,
    post_stages: Arc<Vec<Arc<dyn PostStage>>>,
    relay: StreamRelay,
    mode: RelayMode,
}

impl Pipeline {
    pub fn new(relay: StreamRelay, mode: RelayMode) -> Self {
        Self {
            stages: Vec::new(),
            post_stages: Arc::new(Vec::new()),
            relay,
            mode,
        }
    }

    pub fn with_stage(mut self, stage: Arc<dyn Stage>) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn with_post_stage(mut self, stage: Arc<dyn PostStage>) -> Self {
        Arc::make_mut(&mut self.post_stages).push(stage);
        self
    }

    pub fn mode(&self) -> RelayMode {
        self.mode
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|stage| stage.name()).collect()
    }

    pub async fn handle(&self, mut ctx: CallContext) -> Response {
        for stage in &self.stages {
            match stage.run(&mut ctx).await {
                StageOutcome::Continue => {}
                StageOutcome::Abort(response) => {
                    tracing::debug!(
                        request_id = %ctx.request_id,
                        stage = stage.name(),
                        status = response.status().as_u16(),
                        "pipeline aborted"
                    );
                    return self.finish_aborted(ctx, response).await;
                }
            }
        }

        let extra_headers = ctx.response_headers.clone();
        let upstream = match self.relay.forward(&ctx, self.mode).await {
            Ok(upstream) => upstream,
            Err(err) => {
                tracing::warn!(request_id = %ctx.request_id, error = %err, "backend unreachable");
                let response = StreamRelay::bad_gateway_response();
                return self.finish_aborted(ctx, response).await;
            }
        };

        let status = upstream.status();
        let sink = self.capture_sink(ctx, status);
        let mut response = self.relay.relay_response(upstream, self.mode, sink);
        apply_headers(response.headers_mut(), &extra_headers);
        response
    }

    fn capture_sink(&self, ctx: CallContext, status: StatusCode) -> CaptureSink {
        let post_stages = Arc::clone(&self.post_stages);
        Box::new(move |body: Bytes| {
            async move {
                let captured = CapturedResponse {
                    status,
                    body,
                    latency: ctx.started.elapsed(),
                    aborted: false,
                };
                run_post_stages(&post_stages, &ctx, &captured).await;
            }
            .boxed()
        })
    }

    async fn finish_aborted(&self, ctx: CallContext, response: Response) -> Response {
        let (mut parts, body) = response.into_parts();
        let body = to_bytes(body, MAX_ABORT_BODY_BYTES)
            .await
            .unwrap_or_default();
        apply_headers(&mut parts.headers, &ctx.response_headers);

        let captured = CapturedResponse {
            status: parts.status,
            body: body.clone(),
            latency: ctx.started.elapsed(),
            aborted: true,
        };
        run_post_stages(&self.post_stages, &ctx, &captured).await;
        Response::from_parts(parts, Body::from(body))
    }
}

async fn run_post_stages(
    stages: &[Arc<dyn PostStage>],
    ctx: &CallContext,
    response: &CapturedResponse,
) {
    for stage in stages {
        stage.finish(ctx, response).await;
    }
}

fn apply_headers(target: &mut HeaderMap, extra: &HeaderMap) {
    for (name, value) in extra.iter() {
        target.insert(name.clone(), value.clone());
    }
}
