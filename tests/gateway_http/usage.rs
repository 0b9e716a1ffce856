fn usage_row(id: i64, user_id: i64, endpoint: &str, status: u16, tokens: u64, at_ms: i64) -> UsageRecord {
    UsageRecord {
        id,
        user_id,
        endpoint: endpoint.to_string(),
        method: "POST".to_string(),
        status,
        request_size: 10,
        response_size: 20,
        latency_ms: 100,
        model: "gpt-4o".to_string(),
        input_tokens: tokens / 2,
        output_tokens: tokens - tokens / 2,
        total_tokens: tokens,
        error_message: None,
        created_at_ms: at_ms,
    }
}

// 2023-11-14T00:00:00Z
const DAY_START_MS: i64 = 1_699_920_000_000;

async fn seed_usage(store: &SqliteStore) {
    let rows = [
        usage_row(1, 7, "/v1/chat/completions", 200, 30, DAY_START_MS + 1_000),
        usage_row(2, 7, "/v1/chat/completions", 429, 0, DAY_START_MS + 2_000),
        usage_row(3, 7, "/v1/models", 304, 0, DAY_START_MS + 3_000),
        usage_row(4, 7, "/v1/chat/completions", 500, 0, DAY_START_MS - 1_000),
        usage_row(5, 8, "/v1/chat/completions", 200, 99, DAY_START_MS + 1_000),
    ];
    for row in rows {
        store.insert_usage(row).await.expect("insert usage");
    }
}

#[tokio::test]
async fn usage_total_summarizes_the_callers_history() {
    let h = harness("http://127.0.0.1:9".to_string()).await;
    seed_usage(&h.store).await;

    let response = h
        .app
        .clone()
        .oneshot(post_json("/usage/total", Some(&token_for(7)), &json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let data = read_json(response).await["data"].clone();
    assert_eq!(data["total_requests"], 4);
    assert_eq!(data["success_count"], 1);
    assert_eq!(data["fail_count"], 2);
    assert_eq!(data["total_tokens"], 30);
    assert_eq!(data["avg_latency_ms"], 100.0);
}

#[tokio::test]
async fn usage_stats_breaks_a_day_down_by_endpoint() {
    let h = harness("http://127.0.0.1:9".to_string()).await;
    seed_usage(&h.store).await;

    let response = h
        .app
        .clone()
        .oneshot(post_json(
            "/usage/stats",
            Some(&token_for(7)),
            &json!({"date": "2023-11-14"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let data = read_json(response).await["data"].clone();
    assert_eq!(data["total_requests"], 3);
    assert_eq!(data["success_count"], 1);
    assert_eq!(data["fail_count"], 2);
    assert_eq!(data["details"][0]["endpoint"], "/v1/chat/completions");
    assert_eq!(data["details"][0]["count"], 2);
    assert_eq!(data["details"][0]["total_tokens"], 30);
    assert_eq!(data["details"][1]["endpoint"], "/v1/models");
}

#[tokio::test]
async fn usage_stats_rejects_malformed_dates() {
    let h = harness("http://127.0.0.1:9".to_string()).await;

    let response = h
        .app
        .clone()
        .oneshot(post_json(
            "/usage/stats",
            Some(&token_for(7)),
            &json!({"date": "14/11/2023"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let envelope = read_json(response).await;
    assert_eq!(envelope["error"]["code"], "1001");
    assert_eq!(envelope["error"]["param"], "date");
}

#[tokio::test]
async fn usage_endpoints_require_a_token() {
    let h = harness("http://127.0.0.1:9".to_string()).await;
    let request = Request::builder()
        .method("POST")
        .uri("/usage/stats")
        .body(Body::empty())
        .unwrap();
    let response = h.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}
