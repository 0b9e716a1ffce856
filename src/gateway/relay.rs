//! Forwarding engine between the gateway and the inference backend.
//!
//! Responses are streamed back chunk by chunk. Every byte handed to the caller
//! is also appended to a capture buffer that is passed, once, to a
//! [`CaptureSink`] when the stream ends or the caller drops it.

use std::collections::BTreeMap;
use std::time::Duration;

use axum::body::Body;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::Response;
use bytes::{Bytes, BytesMut};
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use thiserror::Error;

use super::config::BackendConfig;
use super::pipeline::CallContext;

pub const USER_ID_HEADER: &str = "x-user-id";
const RELAY_CHUNK_BYTES: usize = 8 * 1024;
const BAD_GATEWAY_BODY: &str = r#"{"error":{"message":"upstream error","type":"bad_gateway"}}"#;

/// Receives the full captured response body exactly once.
pub type CaptureSink = Box<dyn FnOnce(Bytes) -> BoxFuture<'static, ()> + Send>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelayMode {
    /// Content-aware chat relay: no total timeout, streaming-friendly headers.
    Chat,
    /// Byte-for-byte proxy for every other backend path.
    Passthrough,
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("backend http client error: {0}")]
    Client(#[source] reqwest::Error),
    #[error("backend request failed: {0}")]
    Request(#[source] reqwest::Error),
    #[error("invalid backend header: {0}")]
    InvalidHeader(String),
}

#[derive(Clone)]
pub struct StreamRelay {
    base_url: String,
    streaming_client: reqwest::Client,
    client: reqwest::Client,
    headers: HeaderMap,
}

impl StreamRelay {
    pub fn new(config: &BackendConfig) -> Result<Self, RelayError> {
        let connect_timeout = Duration::from_secs(config.connect_timeout_secs.max(1));
        let streaming_client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(RelayError::Client)?;

        let mut builder = reqwest::Client::builder().connect_timeout(connect_timeout);
        if let Some(seconds) = config.request_timeout_secs.filter(|seconds| *seconds > 0) {
            builder = builder.timeout(Duration::from_secs(seconds));
        }
        let client = builder.build().map_err(RelayError::Client)?;

        Ok(Self {
            base_url: config.base_url.clone(),
            streaming_client,
            client,
            headers: parse_headers(&config.headers)?,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn forward(
        &self,
        ctx: &CallContext,
        mode: RelayMode,
    ) -> Result<reqwest::Response, RelayError> {
        let path_and_query = strip_query_param(&ctx.path_and_query, "token");
        let url = join_base_url(&self.base_url, &path_and_query);

        let mut headers = ctx.headers.clone();
        sanitize_request_headers(&mut headers);
        if mode == RelayMode::Chat {
            headers.remove("accept-encoding");
        }
        for (name, value) in self.headers.iter() {
            headers.insert(name.clone(), value.clone());
        }
        if let Some(user_id) = ctx.user_id {
            headers.insert(USER_ID_HEADER, HeaderValue::from(user_id));
        }

        let client = match mode {
            RelayMode::Chat => &self.streaming_client,
            RelayMode::Passthrough => &self.client,
        };
        let mut req = client.request(ctx.method.clone(), url).headers(headers);
        if !ctx.body.is_empty() {
            req = req.body(ctx.body.clone());
        }
        req.send().await.map_err(RelayError::Request)
    }

    pub fn relay_response(
        &self,
        upstream: reqwest::Response,
        mode: RelayMode,
        sink: CaptureSink,
    ) -> Response {
        let status = upstream.status();
        let mut headers = upstream.headers().clone();
        sanitize_response_headers(&mut headers);
        if mode == RelayMode::Chat && is_event_stream(&headers) {
            apply_streaming_headers(&mut headers);
        }

        let upstream: BoxStream<'static, Result<Bytes, std::io::Error>> = upstream
            .bytes_stream()
            .map(|chunk| chunk.map_err(std::io::Error::other))
            .boxed();
        let state = CaptureStreamState {
            upstream,
            pending: Bytes::new(),
            captured: BytesMut::new(),
            sink: Some(sink),
        };

        let stream = futures_util::stream::try_unfold(state, |mut state| async move {
            loop {
                if !state.pending.is_empty() {
                    let take = state.pending.len().min(RELAY_CHUNK_BYTES);
                    let frame = state.pending.split_to(take);
                    state.captured.extend_from_slice(&frame);
                    return Ok(Some((frame, state)));
                }
                match state.upstream.next().await {
                    Some(Ok(chunk)) => state.pending = chunk,
                    Some(Err(err)) => {
                        state.finish().await;
                        return Err(err);
                    }
                    None => {
                        state.finish().await;
                        return Ok(None);
                    }
                }
            }
        });

        let mut response = Response::new(Body::from_stream(stream));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        response
    }

    pub fn bad_gateway_response() -> Response {
        let mut response = Response::new(Body::from(BAD_GATEWAY_BODY));
        *response.status_mut() = StatusCode::BAD_GATEWAY;
        response.headers_mut().insert(
            axum::http::header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        response
    }
}

impl std::fmt::Debug for StreamRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamRelay")
            .field("base_url", &self.base_url)
            .field("headers", &"<redacted>")
            .finish()
    }
}

struct CaptureStreamState {
    upstream: BoxStream<'static, Result<Bytes, std::io::Error>>,
    pending: Bytes,
    captured: BytesMut,
    sink: Option<CaptureSink>,
}

impl CaptureStreamState {
    async fn finish(&mut self) {
        let Some(sink) = self.sink.take() else {
            return;
        };
        let body = std::mem::take(&mut self.captured).freeze();
        sink(body).await;
    }
}

impl Drop for CaptureStreamState {
    fn drop(&mut self) {
        // Caller went away before the end of the stream.
        let Some(sink) = self.sink.take() else {
            return;
        };
        let body = std::mem::take(&mut self.captured).freeze();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(sink(body));
            }
            Err(_) => {
                tracing::warn!("no runtime available to finalize a dropped relay stream");
            }
        }
    }
}

pub fn is_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.trim().to_ascii_lowercase().starts_with("text/event-stream"))
}

fn apply_streaming_headers(headers: &mut HeaderMap) {
    let defaults = [("cache-control", "no-cache"), ("x-accel-buffering", "no")];
    for (name, value) in defaults {
        if !headers.contains_key(name) {
            headers.insert(name, HeaderValue::from_static(value));
        }
    }
}

const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
];

fn remove_hop_by_hop(headers: &mut HeaderMap) {
    // Headers named by `Connection` are hop-by-hop as well.
    let listed: Vec<String> = headers
        .get_all("connection")
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();
    for name in listed {
        headers.remove(name.as_str());
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
    headers.remove("upgrade");
}

fn sanitize_request_headers(headers: &mut HeaderMap) {
    remove_hop_by_hop(headers);
    headers.remove("host");
    headers.remove("content-length");
    headers.remove("authorization");
    headers.remove(USER_ID_HEADER);
}

fn sanitize_response_headers(headers: &mut HeaderMap) {
    remove_hop_by_hop(headers);
    headers.remove("content-length");
    headers.remove("vary");
    let cors: Vec<HeaderName> = headers
        .keys()
        .filter(|name| name.as_str().starts_with("access-control-"))
        .cloned()
        .collect();
    for name in cors {
        headers.remove(name);
    }
}

fn strip_query_param(path_and_query: &str, param: &str) -> String {
    let Some((path, query)) = path_and_query.split_once('?') else {
        return path_and_query.to_string();
    };
    let kept: Vec<&str> = query
        .split('&')
        .filter(|pair| {
            let name = pair.split_once('=').map(|(name, _)| name).unwrap_or(pair);
            !pair.is_empty() && name != param
        })
        .collect();
    if kept.is_empty() {
        path.to_string()
    } else {
        format!("{path}?{}", kept.join("&"))
    }
}

fn join_base_url(base_url: &str, path: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let path_no_leading_slash = path.strip_prefix('/').unwrap_or(path);

    // A base_url ending in /v1 still accepts /v1-prefixed gateway paths.
    if base.ends_with("/v1") {
        if path_no_leading_slash == "v1" {
            return base.to_string();
        }
        if let Some(rest) = path_no_leading_slash.strip_prefix("v1/") {
            return format!("{base}/{rest}");
        }
        if let Some(rest) = path_no_leading_slash.strip_prefix("v1?") {
            return format!("{base}?{rest}");
        }
    }
    format!("{base}/{path_no_leading_slash}")
}

fn parse_headers(headers: &BTreeMap<String, String>) -> Result<HeaderMap, RelayError> {
    let mut out = HeaderMap::new();
    for (name, value) in headers {
        let header_name = name
            .parse::<HeaderName>()
            .map_err(|_| RelayError::InvalidHeader(format!("invalid header name: {name}")))?;
        let header_value = value
            .parse::<HeaderValue>()
            .map_err(|_| RelayError::InvalidHeader(format!("invalid header value for {name}")))?;
        out.insert(header_name, header_value);
    }
    Ok(out)
}
