use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use redis::AsyncCommands;
use thiserror::Error;

use super::auth::{AuthError, TokenVersionStore};
use super::broadcast::{BrokerError, MessageBroker};
use super::limits::{QuotaCharge, QuotaDimension, QuotaStore, QuotaStoreError};

/// Checks both window counters, then increments both, as one script run.
///
/// KEYS: request counter, token counter.
/// ARGV: request enabled, request limit, request cost,
///       token enabled, token limit, token cost, ttl seconds.
/// Returns `{1, ""}` when charged, `{0, "<dimension>"}` when denied.
const QUOTA_SCRIPT: &str = r#"
local req_enabled = tonumber(ARGV[1]) == 1
local req_limit = tonumber(ARGV[2])
local req_cost = tonumber(ARGV[3])
local tok_enabled = tonumber(ARGV[4]) == 1
local tok_limit = tonumber(ARGV[5])
local tok_cost = tonumber(ARGV[6])
local ttl = tonumber(ARGV[7])

if req_enabled then
  local current = tonumber(redis.call("GET", KEYS[1]) or "0")
  if current + req_cost > req_limit then
    return {0, "request"}
  end
end
if tok_enabled then
  local current = tonumber(redis.call("GET", KEYS[2]) or "0")
  if current + tok_cost > tok_limit then
    return {0, "token"}
  end
end

if req_enabled then
  local value = redis.call("INCRBY", KEYS[1], req_cost)
  if value == req_cost then
    redis.call("EXPIRE", KEYS[1], ttl)
  end
end
if tok_enabled then
  local value = redis.call("INCRBY", KEYS[2], tok_cost)
  if value == tok_cost then
    redis.call("EXPIRE", KEYS[2], ttl)
  end
end
return {1, ""}
"#;

#[derive(Clone, Debug)]
pub struct RedisStore {
    client: redis::Client,
    prefix: String,
}

#[derive(Debug, Error)]
pub enum RedisStoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

impl RedisStore {
    pub fn new(url: impl AsRef<str>) -> Result<Self, RedisStoreError> {
        Ok(Self {
            client: redis::Client::open(url.as_ref())?,
            prefix: String::new(),
        })
    }

    /// Namespace for token-version keys; empty keeps the bare `<user_id>` key.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, redis::RedisError> {
        self.client.get_multiplexed_async_connection().await
    }

    pub async fn ping(&self) -> Result<(), RedisStoreError> {
        let mut conn = self.connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    fn key_token_version(&self, user_id: i64) -> String {
        if self.prefix.is_empty() {
            user_id.to_string()
        } else {
            format!("{}:{user_id}", self.prefix)
        }
    }

    pub async fn token_version(&self, user_id: i64) -> Result<u64, RedisStoreError> {
        let mut conn = self.connection().await?;
        let raw: Option<u64> = conn.get(self.key_token_version(user_id)).await?;
        Ok(raw.unwrap_or(0))
    }

    pub async fn increment_token_version(&self, user_id: i64) -> Result<u64, RedisStoreError> {
        let mut conn = self.connection().await?;
        let value: u64 = conn.incr(self.key_token_version(user_id), 1u64).await?;
        Ok(value)
    }
}

#[async_trait]
impl QuotaStore for RedisStore {
    async fn check_and_consume(
        &self,
        charge: &QuotaCharge,
    ) -> Result<Option<QuotaDimension>, QuotaStoreError> {
        let mut conn = self
            .connection()
            .await
            .map_err(|err| QuotaStoreError::Unavailable(err.to_string()))?;

        let (allowed, dimension): (i64, String) = redis::Script::new(QUOTA_SCRIPT)
            .key(&charge.request_key)
            .key(&charge.token_key)
            .arg(i64::from(charge.request_enabled()))
            .arg(charge.request_limit)
            .arg(charge.request_cost)
            .arg(i64::from(charge.token_enabled()))
            .arg(charge.token_limit)
            .arg(charge.token_cost)
            .arg(charge.ttl_seconds.max(1))
            .invoke_async(&mut conn)
            .await
            .map_err(|err| QuotaStoreError::Unavailable(err.to_string()))?;

        match (allowed, dimension.as_str()) {
            (1, _) => Ok(None),
            (0, raw) => QuotaDimension::parse(raw)
                .map(Some)
                .ok_or_else(|| QuotaStoreError::Malformed(format!("unknown dimension {raw:?}"))),
            (code, _) => Err(QuotaStoreError::Malformed(format!(
                "unexpected quota script code {code}"
            ))),
        }
    }
}

#[async_trait]
impl TokenVersionStore for RedisStore {
    async fn latest_version(&self, user_id: i64) -> Result<u64, AuthError> {
        self.token_version(user_id)
            .await
            .map_err(|err| AuthError::VersionStore(err.to_string()))
    }
}

#[async_trait]
impl MessageBroker for RedisStore {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), BrokerError> {
        let mut conn = self
            .connection()
            .await
            .map_err(|err| BrokerError::Unavailable(err.to_string()))?;
        let _: i64 = conn
            .publish(channel, payload)
            .await
            .map_err(|err| BrokerError::Unavailable(err.to_string()))?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>, BrokerError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|err| BrokerError::Subscribe(err.to_string()))?;
        pubsub
            .subscribe(channel)
            .await
            .map_err(|err| BrokerError::Subscribe(err.to_string()))?;
        let stream = pubsub
            .into_on_message()
            .filter_map(|msg| async move {
                match msg.get_payload::<String>() {
                    Ok(payload) => Some(payload),
                    Err(err) => {
                        tracing::warn!(error = %err, "dropping undecodable chat payload");
                        None
                    }
                }
            });
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests;
