use std::sync::atomic::{AtomicUsize, Ordering};

use super::*;

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn redis_url() -> Option<String> {
    env_nonempty("DITTO_REDIS_URL").or_else(|| env_nonempty("REDIS_URL"))
}

static PREFIX_COUNTER: AtomicUsize = AtomicUsize::new(0);

fn test_prefix() -> String {
    let n = PREFIX_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("ditto-chat-test-{}-{n}", std::process::id())
}

fn charge(prefix: &str, request_limit: u64, token_limit: u64, token_cost: u64) -> QuotaCharge {
    QuotaCharge {
        request_key: format!("{prefix}:req:1:1"),
        token_key: format!("{prefix}:tok:1:1"),
        request_limit,
        request_cost: 1,
        token_limit,
        token_cost,
        ttl_seconds: 120,
    }
}

#[tokio::test]
async fn redis_quota_script_denies_without_partial_charge() {
    let Some(url) = redis_url() else {
        return;
    };
    let store = RedisStore::new(url).expect("store");
    let prefix = test_prefix();

    assert_eq!(
        store.check_and_consume(&charge(&prefix, 2, 15, 10)).await.expect("first"),
        None
    );
    assert_eq!(
        store.check_and_consume(&charge(&prefix, 2, 15, 10)).await.expect("second"),
        Some(QuotaDimension::Token)
    );
    assert_eq!(
        store.check_and_consume(&charge(&prefix, 2, 100, 10)).await.expect("third"),
        None
    );
    assert_eq!(
        store.check_and_consume(&charge(&prefix, 2, 100, 10)).await.expect("fourth"),
        Some(QuotaDimension::Request)
    );

    let mut conn = store.connection().await.expect("conn");
    let requests: u64 = conn.get(format!("{prefix}:req:1:1")).await.expect("get");
    let tokens: u64 = conn.get(format!("{prefix}:tok:1:1")).await.expect("get");
    let ttl: i64 = conn.ttl(format!("{prefix}:req:1:1")).await.expect("ttl");
    assert_eq!((requests, tokens), (2, 20));
    assert!(ttl > 0 && ttl <= 120);
}

#[tokio::test]
async fn redis_token_versions_default_to_zero() {
    let Some(url) = redis_url() else {
        return;
    };
    let store = RedisStore::new(url).expect("store").with_prefix(test_prefix());
    assert_eq!(store.latest_version(42).await.expect("missing"), 0);
    assert_eq!(store.increment_token_version(42).await.expect("incr"), 1);
    assert_eq!(store.latest_version(42).await.expect("present"), 1);
}

#[tokio::test]
async fn redis_broker_delivers_published_payloads() {
    let Some(url) = redis_url() else {
        return;
    };
    let store = RedisStore::new(url).expect("store");
    let channel = format!("{}:user:9", test_prefix());
    let mut subscription = store.subscribe(&channel).await.expect("subscribe");
    store
        .publish(&channel, "{\"content\":\"hi\"}".to_string())
        .await
        .expect("publish");
    let payload = tokio::time::timeout(std::time::Duration::from_secs(5), subscription.next())
        .await
        .expect("timely")
        .expect("payload");
    assert_eq!(payload, "{\"content\":\"hi\"}");
}

#[test]
fn token_version_key_is_bare_user_id_without_prefix() {
    let store = RedisStore::new("redis://127.0.0.1:6379").expect("store");
    assert_eq!(store.key_token_version(7), "7");
    let store = store.with_prefix("auth");
    assert_eq!(store.key_token_version(7), "auth:7");
}
