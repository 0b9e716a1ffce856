//! Dual-dimension (request count, token volume) fixed-window quota.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;

use super::config::{DEFAULT_TOKEN_K, RateLimitConfigCache, RateLimitSettings};
use super::envelope::{ApiError, StatCode};
use super::pipeline::{CallContext, Stage, StageOutcome};
use super::token_count::{estimate_prompt_tokens, parse_max_tokens};
use super::{Clock, SystemClock};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QuotaDimension {
    Request,
    Token,
}

impl QuotaDimension {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Token => "token",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "request" => Some(Self::Request),
            "token" => Some(Self::Token),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum QuotaStoreError {
    #[error("quota store unavailable: {0}")]
    Unavailable(String),
    #[error("malformed quota store result: {0}")]
    Malformed(String),
}

#[derive(Debug)]
pub enum QuotaDecision {
    Allowed,
    Denied(QuotaDimension),
    Unavailable(QuotaStoreError),
}

/// One atomic check-and-increment over both window counters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QuotaCharge {
    pub request_key: String,
    pub token_key: String,
    pub request_limit: u64,
    pub request_cost: u64,
    pub token_limit: u64,
    pub token_cost: u64,
    pub ttl_seconds: u64,
}

impl QuotaCharge {
    pub fn request_enabled(&self) -> bool {
        self.request_limit > 0 && self.request_cost > 0
    }

    pub fn token_enabled(&self) -> bool {
        self.token_limit > 0 && self.token_cost > 0
    }
}

/// A store that can run [`QuotaCharge`] indivisibly with respect to other callers.
///
/// Returns `Ok(None)` when both counters were incremented, or the first
/// dimension (request before token) that would exceed its limit, in which case
/// no counter changes.
#[async_trait]
pub trait QuotaStore: Send + Sync {
    async fn check_and_consume(
        &self,
        charge: &QuotaCharge,
    ) -> Result<Option<QuotaDimension>, QuotaStoreError>;
}

pub fn calculate_token_cost(prompt_tokens: u64, max_tokens: u64, k: u64) -> u64 {
    let k = if k == 0 { DEFAULT_TOKEN_K } else { k };
    let total = prompt_tokens.saturating_add(max_tokens);
    if total == 0 {
        return 0;
    }
    total.div_ceil(k)
}

pub fn window_id(now_epoch_seconds: u64, window_seconds: u64) -> u64 {
    now_epoch_seconds / window_seconds.max(1)
}

pub fn quota_keys(prefix: &str, subject_id: i64, window: u64) -> (String, String) {
    (
        format!("{prefix}:req:{subject_id}:{window}"),
        format!("{prefix}:tok:{subject_id}:{window}"),
    )
}

pub struct QuotaLedger {
    config: Arc<RateLimitConfigCache>,
    store: Arc<dyn QuotaStore>,
    clock: Arc<dyn Clock>,
}

impl QuotaLedger {
    pub fn new(config: Arc<RateLimitConfigCache>, store: Arc<dyn QuotaStore>) -> Self {
        Self::with_clock(config, store, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: Arc<RateLimitConfigCache>,
        store: Arc<dyn QuotaStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            store,
            clock,
        }
    }

    pub fn settings(&self) -> Arc<RateLimitSettings> {
        self.config.get()
    }

    /// Token cost of a chat payload; at least 1 while the token dimension is on.
    pub fn token_cost_for(&self, settings: &RateLimitSettings, payload: &Map<String, Value>) -> u64 {
        let prompt_tokens = estimate_prompt_tokens(payload);
        let max_tokens = parse_max_tokens(payload, settings.default_max_tokens);
        let cost = calculate_token_cost(prompt_tokens, max_tokens, settings.token_k);
        if settings.token_enabled() {
            cost.max(1)
        } else {
            cost
        }
    }

    pub async fn consume(&self, subject_id: i64, request_cost: u64, token_cost: u64) -> QuotaDecision {
        let settings = self.config.get();
        if !settings.any_enabled() {
            return QuotaDecision::Allowed;
        }

        let window = window_id(self.clock.now_epoch_seconds(), settings.window_seconds);
        let (request_key, token_key) = quota_keys(&settings.prefix, subject_id, window);
        let charge = QuotaCharge {
            request_key,
            token_key,
            request_limit: settings.request_per_min,
            request_cost,
            token_limit: settings.token_per_min,
            token_cost,
            ttl_seconds: settings.window_seconds.saturating_mul(2),
        };

        match self.store.check_and_consume(&charge).await {
            Ok(None) => QuotaDecision::Allowed,
            Ok(Some(dimension)) => QuotaDecision::Denied(dimension),
            Err(err) => QuotaDecision::Unavailable(err),
        }
    }
}

/// Pipeline stage guarding `/v1/chat/completions`. An empty body is charged
/// the default response budget.
pub struct QuotaStage {
    ledger: Arc<QuotaLedger>,
}

impl QuotaStage {
    pub fn new(ledger: Arc<QuotaLedger>) -> Self {
        Self { ledger }
    }
}

#[async_trait]
impl Stage for QuotaStage {
    fn name(&self) -> &'static str {
        "quota"
    }

    async fn run(&self, ctx: &mut CallContext) -> StageOutcome {
        let Some(user_id) = ctx.user_id.filter(|id| *id > 0) else {
            return ApiError::unauthorized("token is invalid or expired").into();
        };

        let settings = self.ledger.settings();
        if !settings.any_enabled() {
            return StageOutcome::Continue;
        }

        let token_cost = if !settings.token_enabled() {
            0
        } else if ctx.body.is_empty() {
            self.ledger.token_cost_for(&settings, &Map::new())
        } else {
            match ctx.json_body() {
                Ok(payload) => self.ledger.token_cost_for(&settings, &payload),
                Err(err) => return err.into(),
            }
        };

        match self.ledger.consume(user_id, 1, token_cost).await {
            QuotaDecision::Allowed => StageOutcome::Continue,
            QuotaDecision::Denied(dimension) => {
                tracing::info!(
                    request_id = %ctx.request_id,
                    user_id,
                    dimension = dimension.as_str(),
                    token_cost,
                    "quota exceeded"
                );
                ApiError::new(StatCode::TooManyRequests, "rate limit exceeded")
                    .with_details(format!("dimension={}", dimension.as_str()))
                    .into()
            }
            QuotaDecision::Unavailable(err) => {
                tracing::warn!(
                    request_id = %ctx.request_id,
                    user_id,
                    error = %err,
                    "quota store unavailable; allowing request"
                );
                StageOutcome::Continue
            }
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct CounterEntry {
    value: u64,
    expires_at_ms: Option<u64>,
}

/// In-process quota store; a single mutex makes each charge atomic.
pub struct MemoryQuotaStore {
    counters: Mutex<HashMap<String, CounterEntry>>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryQuotaStore {
    fn default() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }
}

impl MemoryQuotaStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            counters: Mutex::new(HashMap::new()),
            clock,
        }
    }

    pub fn counter(&self, key: &str) -> u64 {
        let now_ms = self.clock.now_millis();
        let counters = self
            .counters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        live_value(&counters, key, now_ms)
    }
}

fn live_value(counters: &HashMap<String, CounterEntry>, key: &str, now_ms: u64) -> u64 {
    match counters.get(key) {
        Some(entry) if entry.expires_at_ms.is_none_or(|at| at > now_ms) => entry.value,
        _ => 0,
    }
}

#[async_trait]
impl QuotaStore for MemoryQuotaStore {
    async fn check_and_consume(
        &self,
        charge: &QuotaCharge,
    ) -> Result<Option<QuotaDimension>, QuotaStoreError> {
        let now_ms = self.clock.now_millis();
        let mut counters = self
            .counters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        counters.retain(|_, entry| entry.expires_at_ms.is_none_or(|at| at > now_ms));

        let request_current = live_value(&counters, &charge.request_key, now_ms);
        if charge.request_enabled()
            && request_current.saturating_add(charge.request_cost) > charge.request_limit
        {
            return Ok(Some(QuotaDimension::Request));
        }
        let token_current = live_value(&counters, &charge.token_key, now_ms);
        if charge.token_enabled()
            && token_current.saturating_add(charge.token_cost) > charge.token_limit
        {
            return Ok(Some(QuotaDimension::Token));
        }

        let ttl_ms = charge.ttl_seconds.saturating_mul(1000);
        let mut bump = |key: &str, cost: u64| {
            let entry = counters.entry(key.to_string()).or_insert(CounterEntry {
                value: 0,
                expires_at_ms: None,
            });
            entry.value = entry.value.saturating_add(cost);
            if entry.value == cost && ttl_ms > 0 {
                entry.expires_at_ms = Some(now_ms.saturating_add(ttl_ms));
            }
        };
        if charge.request_enabled() {
            bump(&charge.request_key, charge.request_cost);
        }
        if charge.token_enabled() {
            bump(&charge.token_key, charge.token_cost);
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;
    use crate::gateway::config::RateLimitConfig;

    struct TestClock(AtomicU64);

    impl Clock for TestClock {
        fn now_millis(&self) -> u64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn ledger(request_per_min: i64, token_per_min: i64, clock: Arc<TestClock>) -> (QuotaLedger, Arc<MemoryQuotaStore>) {
        let config = Arc::new(RateLimitConfigCache::from_config(RateLimitConfig {
            request_per_min,
            token_per_min,
            ..RateLimitConfig::default()
        }));
        let store = Arc::new(MemoryQuotaStore::with_clock(clock.clone()));
        (QuotaLedger::with_clock(config, store.clone(), clock), store)
    }

    #[test]
    fn token_cost_matches_reference_values() {
        assert_eq!(calculate_token_cost(0, 0, 100), 0);
        assert_eq!(calculate_token_cost(1, 0, 100), 1);
        assert_eq!(calculate_token_cost(99, 1, 100), 1);
        assert_eq!(calculate_token_cost(100, 1, 100), 2);
        assert_eq!(calculate_token_cost(120, 80, 50), 4);
        assert_eq!(calculate_token_cost(150, 0, 0), 2);
    }

    #[test]
    fn window_keys_change_across_boundary() {
        assert_eq!(window_id(119, 60), 1);
        assert_eq!(window_id(120, 60), 2);
        let before = quota_keys("rl:chat", 7, window_id(119, 60));
        let after = quota_keys("rl:chat", 7, window_id(120, 60));
        assert_eq!(before.0, "rl:chat:req:7:1");
        assert_eq!(before.1, "rl:chat:tok:7:1");
        assert_ne!(before, after);
    }

    #[tokio::test]
    async fn disabled_limits_never_touch_the_store() {
        let clock = Arc::new(TestClock(AtomicU64::new(60_000)));
        let (ledger, store) = ledger(0, 0, clock);
        for _ in 0..5 {
            assert!(matches!(ledger.consume(1, 1, 10).await, QuotaDecision::Allowed));
        }
        assert_eq!(store.counter("rl:chat:req:1:1"), 0);
    }

    #[tokio::test]
    async fn request_dimension_denies_without_partial_charge() {
        let clock = Arc::new(TestClock(AtomicU64::new(60_000)));
        let (ledger, store) = ledger(2, 100, clock);

        assert!(matches!(ledger.consume(1, 1, 10).await, QuotaDecision::Allowed));
        assert!(matches!(ledger.consume(1, 1, 10).await, QuotaDecision::Allowed));
        assert!(matches!(
            ledger.consume(1, 1, 10).await,
            QuotaDecision::Denied(QuotaDimension::Request)
        ));
        assert_eq!(store.counter("rl:chat:req:1:1"), 2);
        assert_eq!(store.counter("rl:chat:tok:1:1"), 20);
    }

    #[tokio::test]
    async fn token_dimension_denies_without_charging_requests() {
        let clock = Arc::new(TestClock(AtomicU64::new(60_000)));
        let (ledger, store) = ledger(10, 15, clock);

        assert!(matches!(ledger.consume(1, 1, 10).await, QuotaDecision::Allowed));
        assert!(matches!(
            ledger.consume(1, 1, 10).await,
            QuotaDecision::Denied(QuotaDimension::Token)
        ));
        assert_eq!(store.counter("rl:chat:req:1:1"), 1);
        assert_eq!(store.counter("rl:chat:tok:1:1"), 10);
    }

    #[tokio::test]
    async fn request_denial_wins_when_both_exceed() {
        let clock = Arc::new(TestClock(AtomicU64::new(60_000)));
        let (ledger, _store) = ledger(1, 5, clock);
        assert!(matches!(ledger.consume(1, 1, 5).await, QuotaDecision::Allowed));
        assert!(matches!(
            ledger.consume(1, 1, 5).await,
            QuotaDecision::Denied(QuotaDimension::Request)
        ));
    }

    #[tokio::test]
    async fn new_window_starts_fresh_and_old_keys_expire() {
        let clock = Arc::new(TestClock(AtomicU64::new(60_000)));
        let (ledger, store) = ledger(1, 0, clock.clone());
        assert!(matches!(ledger.consume(1, 1, 0).await, QuotaDecision::Allowed));
        assert!(matches!(ledger.consume(1, 1, 0).await, QuotaDecision::Denied(_)));

        clock.0.store(120_000, Ordering::SeqCst);
        assert!(matches!(ledger.consume(1, 1, 0).await, QuotaDecision::Allowed));

        // ttl is twice the window
        clock.0.store(60_000 + 120_000, Ordering::SeqCst);
        assert_eq!(store.counter("rl:chat:req:1:1"), 0);
    }

    #[tokio::test]
    async fn concurrent_consumers_never_exceed_limit() {
        let clock = Arc::new(TestClock(AtomicU64::new(60_000)));
        let (ledger, store) = ledger(25, 0, clock);
        let ledger = Arc::new(ledger);

        let mut handles = Vec::new();
        for _ in 0..100 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move { ledger.consume(9, 1, 0).await }));
        }
        let mut allowed = 0;
        for handle in handles {
            if matches!(handle.await.expect("join"), QuotaDecision::Allowed) {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 25);
        assert_eq!(store.counter("rl:chat:req:9:1"), 25);
    }

    #[test]
    fn token_cost_has_floor_of_one_when_enabled() {
        let clock = Arc::new(TestClock(AtomicU64::new(0)));
        let (ledger, _store) = ledger(0, 100, clock);
        let settings = ledger.settings();
        let payload = serde_json::json!({"messages": [], "max_tokens": 0});
        let payload = payload.as_object().cloned().unwrap_or_default();
        assert_eq!(ledger.token_cost_for(&settings, &payload), 1);
    }

    struct DownStore;

    #[async_trait]
    impl QuotaStore for DownStore {
        async fn check_and_consume(
            &self,
            _charge: &QuotaCharge,
        ) -> Result<Option<QuotaDimension>, QuotaStoreError> {
            Err(QuotaStoreError::Unavailable("connection refused".to_string()))
        }
    }

    #[tokio::test]
    async fn unavailable_store_fails_open() {
        let config = Arc::new(RateLimitConfigCache::from_config(RateLimitConfig {
            request_per_min: 1,
            token_per_min: 10,
            ..RateLimitConfig::default()
        }));
        let ledger = Arc::new(QuotaLedger::new(config, Arc::new(DownStore)));
        assert!(matches!(
            ledger.consume(1, 1, 5).await,
            QuotaDecision::Unavailable(QuotaStoreError::Unavailable(_))
        ));

        let stage = QuotaStage::new(ledger);
        let mut ctx = CallContext::new(
            "req-1",
            axum::http::Method::POST,
            "/v1/chat/completions",
            axum::http::HeaderMap::new(),
            bytes::Bytes::from_static(br#"{"messages":[{"role":"user","content":"hi"}]}"#),
        );
        ctx.user_id = Some(1);
        for _ in 0..3 {
            assert!(matches!(stage.run(&mut ctx).await, StageOutcome::Continue));
        }
    }
}
