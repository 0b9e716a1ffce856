//! Chat gateway (feature-gated).

pub mod auth;
pub mod broadcast;
pub mod chat_payload;
pub mod config;
pub mod envelope;
pub mod history;
pub mod http;
pub mod ids;
pub mod limits;
pub mod observability;
pub mod pipeline;
pub mod relay;
pub mod sniffer;
pub mod token_count;
pub mod usage;

mod sqlite_store;
mod store_types;

#[cfg(feature = "gateway-store-redis")]
mod redis_store;

use thiserror::Error;

pub use auth::{
    AuthError, AuthGate, Claims, MemoryTokenVersions, TokenVersionStore, sign_token, verify_token,
};
pub use broadcast::{
    BrokerError, ChatFanout, FanoutError, InboundChatMessage, MemoryBroker, MessageBroker,
    OutboundChatMessage,
};
pub use config::{
    ConfigError, GatewayConfig, RateLimitConfig, RateLimitConfigCache, RateLimitSettings,
    RateLimitSource,
};
pub use envelope::{ApiError, StatCode};
pub use history::{ContextAssembler, ContextError, ContextStage, PreparedRequest};
pub use http::{GatewayBackends, GatewayHttpState, router};
pub use ids::IdGenerator;
pub use limits::{
    MemoryQuotaStore, QuotaCharge, QuotaDecision, QuotaDimension, QuotaLedger, QuotaStage,
    QuotaStore, QuotaStoreError,
};
pub use pipeline::{CallContext, CapturedResponse, Pipeline, PostStage, Stage, StageOutcome};
pub use relay::{RelayError, RelayMode, StreamRelay};
pub use sqlite_store::{SqliteStore, SqliteStoreError};
pub use store_types::{
    ChatMessageRecord, ConversationPage, ConversationRecord, MessagePage, MessageRecord,
    NewConversation, NewMessage, UsageEndpointDetail, UsageRecord, UsageTotals,
};
pub use usage::{DailyUsage, UsageRecorder};

#[cfg(feature = "gateway-store-redis")]
pub use redis_store::{RedisStore, RedisStoreError};

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("sqlite store error: {0}")]
    Sqlite(#[from] SqliteStoreError),
    #[cfg(feature = "gateway-store-redis")]
    #[error("redis store error: {0}")]
    Redis(#[from] RedisStoreError),
    #[error("backend error: {message}")]
    Backend { message: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub trait Clock: Send + Sync {
    fn now_millis(&self) -> u64;

    fn now_epoch_seconds(&self) -> u64 {
        self.now_millis() / 1000
    }
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_else(|_| std::time::Duration::from_secs(0));
        u64::try_from(now.as_millis()).unwrap_or(u64::MAX)
    }
}
