//! Bearer-token authentication: HS256 JWT verification plus a per-user
//! version window that bounds how many logins stay valid at once.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::extract::Query;
use axum::http::{HeaderMap, Uri, header};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::envelope::ApiError;
use super::pipeline::{CallContext, Stage, StageOutcome};

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("token is required")]
    MissingToken,
    #[error("signing secret is empty")]
    EmptySecret,
    #[error("malformed token: {0}")]
    Malformed(String),
    #[error("unsupported token algorithm")]
    UnsupportedAlgorithm,
    #[error("token signature mismatch")]
    InvalidSignature,
    #[error("token expired")]
    Expired,
    #[error("token not valid yet")]
    NotYetValid,
    #[error("login device limit reached")]
    DeviceLimit,
    #[error("token version store error: {0}")]
    VersionStore(String),
}

impl AuthError {
    pub fn to_api_error(&self) -> ApiError {
        match self {
            Self::MissingToken | Self::DeviceLimit => ApiError::unauthorized(self.to_string()),
            _ => ApiError::unauthorized("token is invalid or expired"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: i64,
    #[serde(default)]
    pub role: String,
    #[serde(rename = "Version", default)]
    pub version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nbf: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
}

impl Claims {
    /// Claims valid from `now` for `ttl_seconds`.
    pub fn new(user_id: i64, role: impl Into<String>, version: u64, now: i64, ttl_seconds: i64) -> Self {
        Self {
            user_id,
            role: role.into(),
            version,
            sub: Some(user_id.to_string()),
            exp: Some(now.saturating_add(ttl_seconds)),
            nbf: Some(now),
            iat: Some(now),
        }
    }
}

/// Signs HS256 tokens for tooling and tests.
pub fn sign_token(secret: &[u8], claims: &Claims) -> Result<String, AuthError> {
    if secret.is_empty() {
        return Err(AuthError::EmptySecret);
    }
    encode(
        &Header::new(Algorithm::HS256),
        claims,
        &EncodingKey::from_secret(secret),
    )
    .map_err(|err| AuthError::Malformed(err.to_string()))
}

/// Checks signature, algorithm and the `exp`/`nbf` window against the wall clock.
pub fn verify_token(secret: &[u8], token: &str) -> Result<Claims, AuthError> {
    if secret.is_empty() {
        return Err(AuthError::EmptySecret);
    }
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = true;
    validation.validate_nbf = true;
    validation.leeway = 0;
    validation.set_required_spec_claims(&["exp"]);

    decode::<Claims>(token, &DecodingKey::from_secret(secret), &validation)
        .map(|data| data.claims)
        .map_err(|err| convert_jwt_error(&err))
}

fn convert_jwt_error(err: &jsonwebtoken::errors::Error) -> AuthError {
    match err.kind() {
        ErrorKind::InvalidSignature => AuthError::InvalidSignature,
        ErrorKind::InvalidAlgorithm => AuthError::UnsupportedAlgorithm,
        ErrorKind::ExpiredSignature => AuthError::Expired,
        ErrorKind::ImmatureSignature => AuthError::NotYetValid,
        _ => AuthError::Malformed(err.to_string()),
    }
}

/// Bearer header first (prefix matched case-insensitively), then `?token=`.
pub fn extract_token(headers: &HeaderMap, uri: &Uri) -> Option<String> {
    let from_header = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .map(|value| match value.get(..7) {
            Some(prefix) if prefix.eq_ignore_ascii_case("bearer ") => value[7..].trim(),
            _ => value,
        })
        .filter(|token| !token.is_empty())
        .map(str::to_string);
    if from_header.is_some() {
        return from_header;
    }

    let Query(params) = Query::<HashMap<String, String>>::try_from_uri(uri).ok()?;
    params
        .get("token")
        .map(|token| token.trim().to_string())
        .filter(|token| !token.is_empty())
}

/// Latest issued token version per user; a missing entry means 0.
#[async_trait]
pub trait TokenVersionStore: Send + Sync {
    async fn latest_version(&self, user_id: i64) -> Result<u64, AuthError>;
}

#[derive(Debug, Default)]
pub struct MemoryTokenVersions {
    versions: Mutex<HashMap<i64, u64>>,
}

impl MemoryTokenVersions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, user_id: i64, version: u64) {
        self.versions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(user_id, version);
    }

    /// Bumps the version as a fresh login would, returning the new value.
    pub fn increment(&self, user_id: i64) -> u64 {
        let mut versions = self
            .versions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let version = versions.entry(user_id).or_insert(0);
        *version = version.saturating_add(1);
        *version
    }
}

#[async_trait]
impl TokenVersionStore for MemoryTokenVersions {
    async fn latest_version(&self, user_id: i64) -> Result<u64, AuthError> {
        Ok(self
            .versions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&user_id)
            .copied()
            .unwrap_or(0))
    }
}

#[derive(Clone)]
pub struct AuthGate {
    secret: Arc<Vec<u8>>,
    versions: Arc<dyn TokenVersionStore>,
    login_device_max: u64,
}

impl std::fmt::Debug for AuthGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthGate")
            .field("secret", &"<redacted>")
            .field("login_device_max", &self.login_device_max)
            .finish_non_exhaustive()
    }
}

impl AuthGate {
    pub fn new(
        secret: impl Into<Vec<u8>>,
        versions: Arc<dyn TokenVersionStore>,
        login_device_max: u64,
    ) -> Self {
        Self {
            secret: Arc::new(secret.into()),
            versions,
            login_device_max,
        }
    }

    pub fn sign(&self, claims: &Claims) -> Result<String, AuthError> {
        sign_token(&self.secret, claims)
    }

    pub async fn authenticate(&self, headers: &HeaderMap, uri: &Uri) -> Result<Claims, AuthError> {
        let token = extract_token(headers, uri).ok_or(AuthError::MissingToken)?;
        let claims = verify_token(&self.secret, &token)?;

        let latest = match self.versions.latest_version(claims.user_id).await {
            Ok(latest) => latest,
            Err(err) => {
                tracing::warn!(user_id = claims.user_id, error = %err, "token version lookup failed");
                0
            }
        };
        if latest.abs_diff(claims.version) >= self.login_device_max {
            return Err(AuthError::DeviceLimit);
        }
        Ok(claims)
    }
}

#[async_trait]
impl Stage for AuthGate {
    fn name(&self) -> &'static str {
        "auth"
    }

    async fn run(&self, ctx: &mut CallContext) -> StageOutcome {
        let uri = ctx
            .path_and_query
            .parse::<Uri>()
            .unwrap_or_else(|_| Uri::from_static("/"));
        match self.authenticate(&ctx.headers, &uri).await {
            Ok(claims) => {
                ctx.user_id = Some(claims.user_id);
                ctx.role = Some(claims.role);
                tracing::Span::current().record("user_id", claims.user_id);
                StageOutcome::Continue
            }
            Err(err) => {
                tracing::debug!(request_id = %ctx.request_id, error = %err, "authentication failed");
                err.to_api_error().into()
            }
        }
    }
}
