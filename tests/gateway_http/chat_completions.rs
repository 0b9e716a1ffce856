#[tokio::test]
async fn chat_completion_starts_conversation_and_stores_both_turns() {
    if should_skip_httpmock() {
        return;
    }
    let upstream = MockServer::start();
    let first = upstream.mock(|when, then| {
        when.method(POST)
            .path("/v1/chat/completions")
            .header("x-user-id", "7")
            .body_includes("\"hi\"")
            .body_excludes("again")
            .body_excludes("new_chat");
        then.status(200)
            .header("content-type", "application/json")
            .body(
                json!({
                    "model": "gpt-4o-2024-08-06",
                    "choices": [{"message": {"role": "assistant", "content": "hello there"}}],
                    "usage": {"prompt_tokens": 5, "completion_tokens": 7}
                })
                .to_string(),
            );
    });
    let h = harness(upstream.base_url()).await;
    let token = token_for(7);

    let body = json!({
        "model": "gpt-4o",
        "new_chat": true,
        "messages": [
            {"role": "system", "content": "be brief"},
            {"role": "user", "content": "hi"}
        ]
    });
    let response = h
        .app
        .clone()
        .oneshot(post_json("/v1/chat/completions", Some(&token), &body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-request-id"));
    let conversation_id = conversation_header(&response);
    let reply = read_json(response).await;
    assert_eq!(reply["choices"][0]["message"]["content"], "hello there");
    first.assert();

    let conversation = h
        .store
        .get_conversation(conversation_id, 7)
        .await
        .expect("lookup")
        .expect("conversation");
    assert_eq!(conversation.title, "hi");
    assert_eq!(conversation.model, "gpt-4o-2024-08-06");
    assert_eq!(conversation.message_count, 3);
    assert_eq!(conversation.last_message_preview, "hello there");

    let page = h
        .store
        .list_messages(conversation_id, 0, 50)
        .await
        .expect("messages");
    let roles: Vec<&str> = page.items.iter().map(|m| m.role.as_str()).collect();
    assert_eq!(roles, ["system", "user", "assistant"]);

    let second = upstream.mock(|when, then| {
        when.method(POST)
            .path("/v1/chat/completions")
            .body_includes("be brief")
            .body_includes("hello there")
            .body_includes("again")
            .body_excludes("conversation_id");
        then.status(200)
            .header("content-type", "application/json")
            .body(r#"{"choices":[{"message":{"role":"assistant","content":"still here"}}]}"#);
    });
    let body = json!({
        "model": "gpt-4o",
        "conversation_id": conversation_id.to_string(),
        "messages": [{"role": "user", "content": "again"}]
    });
    let response = h
        .app
        .clone()
        .oneshot(post_json("/v1/chat/completions", Some(&token), &body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(conversation_header(&response), conversation_id);
    let _ = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    second.assert();

    let page = h
        .store
        .list_messages(conversation_id, 0, 50)
        .await
        .expect("messages");
    assert_eq!(page.total, 5);
    assert_eq!(page.items[4].content, "still here");
}

#[tokio::test]
async fn streamed_completion_is_relayed_and_captured() {
    if should_skip_httpmock() {
        return;
    }
    let sse = concat!(
        "data: {\"model\":\"gpt-4o\",\"choices\":[{\"delta\":{\"content\":\"你\"}}]}\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"好\"}}],",
        "\"usage\":{\"prompt_tokens\":3,\"completion_tokens\":4,\"total_tokens\":7}}\n\n",
        "data: [DONE]\n\n",
    );
    let upstream = MockServer::start();
    let mock = upstream.mock(|when, then| {
        when.method(POST).path("/v1/chat/completions");
        then.status(200)
            .header("content-type", "text/event-stream")
            .body(sse);
    });
    let h = harness(upstream.base_url()).await;

    let body = json!({
        "model": "gpt-4o",
        "stream": true,
        "messages": [{"role": "user", "content": "greet me"}]
    });
    let response = h
        .app
        .clone()
        .oneshot(post_json("/v1/chat/completions", Some(&token_for(9)), &body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("x-accel-buffering")
            .and_then(|value| value.to_str().ok()),
        Some("no")
    );
    assert_eq!(
        response
            .headers()
            .get("cache-control")
            .and_then(|value| value.to_str().ok()),
        Some("no-cache")
    );
    let conversation_id = conversation_header(&response);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(bytes, sse.as_bytes());
    mock.assert();

    let page = h
        .store
        .list_messages(conversation_id, 0, 50)
        .await
        .expect("messages");
    assert_eq!(page.items.last().map(|m| m.content.as_str()), Some("你好"));

    let usage = h.store.list_usage(9).await.expect("usage");
    assert_eq!(usage.len(), 1);
    assert_eq!(usage[0].endpoint, "/v1/chat/completions");
    assert_eq!(usage[0].status, 200);
    assert_eq!(
        (usage[0].input_tokens, usage[0].output_tokens, usage[0].total_tokens),
        (3, 4, 7)
    );
}

#[tokio::test]
async fn missing_token_is_rejected_before_the_backend() {
    if should_skip_httpmock() {
        return;
    }
    let upstream = MockServer::start();
    let mock = upstream.mock(|when, then| {
        when.method(POST).path("/v1/chat/completions");
        then.status(200).body("{}");
    });
    let h = harness(upstream.base_url()).await;

    let body = json!({"model": "gpt-4o", "messages": [{"role": "user", "content": "hi"}]});
    let response = h
        .app
        .clone()
        .oneshot(post_json("/v1/chat/completions", None, &body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let envelope = read_json(response).await;
    assert_eq!(envelope["success"], false);
    assert_eq!(envelope["error"]["code"], "1002");
    mock.assert_hits(0);

    let usage = h.store.list_usage(0).await.expect("usage");
    assert_eq!(usage.len(), 1);
    assert_eq!(usage[0].status, 401);
    assert_eq!(
        usage[0].error_message.as_deref(),
        Some("gateway: token is required")
    );
}

#[tokio::test]
async fn request_quota_denies_the_second_call_in_a_window() {
    if should_skip_httpmock() {
        return;
    }
    let upstream = MockServer::start();
    let mock = upstream.mock(|when, then| {
        when.method(POST).path("/v1/chat/completions");
        then.status(200)
            .header("content-type", "application/json")
            .body(r#"{"choices":[{"message":{"content":"ok"}}]}"#);
    });
    let h = harness(upstream.base_url()).await;
    h.state.rate_limits().replace(&RateLimitConfig {
        request_per_min: 1,
        window_seconds: 3600,
        ..RateLimitConfig::default()
    });
    let token = token_for(11);
    let body = json!({"model": "gpt-4o", "messages": [{"role": "user", "content": "hi"}]});

    let response = h
        .app
        .clone()
        .oneshot(post_json("/v1/chat/completions", Some(&token), &body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let _ = to_bytes(response.into_body(), usize::MAX).await.unwrap();

    let response = h
        .app
        .clone()
        .oneshot(post_json("/v1/chat/completions", Some(&token), &body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let envelope = read_json(response).await;
    assert_eq!(envelope["error"]["code"], "1006");
    assert_eq!(envelope["error"]["details"], "dimension=request");
    mock.assert_hits(1);
}

struct UnreachableQuotaStore;

#[async_trait::async_trait]
impl QuotaStore for UnreachableQuotaStore {
    async fn check_and_consume(
        &self,
        _charge: &QuotaCharge,
    ) -> Result<Option<QuotaDimension>, QuotaStoreError> {
        Err(QuotaStoreError::Unavailable("redis down".to_string()))
    }
}

#[tokio::test]
async fn quota_store_outage_lets_calls_through() {
    if should_skip_httpmock() {
        return;
    }
    let upstream = MockServer::start();
    let mock = upstream.mock(|when, then| {
        when.method(POST).path("/v1/chat/completions");
        then.status(200)
            .header("content-type", "application/json")
            .body(r#"{"choices":[{"message":{"content":"ok"}}]}"#);
    });
    let h = harness_with_quota(upstream.base_url(), Arc::new(UnreachableQuotaStore)).await;
    h.state.rate_limits().replace(&RateLimitConfig {
        request_per_min: 1,
        token_per_min: 1,
        window_seconds: 3600,
        ..RateLimitConfig::default()
    });
    let token = token_for(12);
    let body = json!({"model": "gpt-4o", "messages": [{"role": "user", "content": "hi"}]});

    for _ in 0..2 {
        let response = h
            .app
            .clone()
            .oneshot(post_json("/v1/chat/completions", Some(&token), &body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let reply = read_json(response).await;
        assert_eq!(reply["choices"][0]["message"]["content"], "ok");
    }
    mock.assert_hits(2);
}

#[tokio::test]
async fn continuing_someone_elses_conversation_is_not_found() {
    if should_skip_httpmock() {
        return;
    }
    let upstream = MockServer::start();
    let mock = upstream.mock(|when, then| {
        when.method(POST).path("/v1/chat/completions");
        then.status(200).body("{}");
    });
    let h = harness(upstream.base_url()).await;
    h.store
        .create_conversation(NewConversation {
            id: 4242,
            user_id: 7,
            title: "mine".to_string(),
            model: "gpt-4o".to_string(),
            created_at_ms: 1_000,
        })
        .await
        .expect("create");

    let body = json!({
        "model": "gpt-4o",
        "conversation_id": 4242,
        "messages": [{"role": "user", "content": "hi"}]
    });
    let response = h
        .app
        .clone()
        .oneshot(post_json("/v1/chat/completions", Some(&token_for(8)), &body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let envelope = read_json(response).await;
    assert_eq!(envelope["error"]["code"], "1004");
    mock.assert_hits(0);
}

#[tokio::test]
async fn malformed_continuation_is_rejected() {
    if should_skip_httpmock() {
        return;
    }
    let upstream = MockServer::start();
    let h = harness(upstream.base_url()).await;
    h.store
        .create_conversation(NewConversation {
            id: 77,
            user_id: 7,
            title: "mine".to_string(),
            model: "gpt-4o".to_string(),
            created_at_ms: 1_000,
        })
        .await
        .expect("create");

    let body = json!({
        "model": "gpt-4o",
        "conversation_id": 77,
        "messages": [
            {"role": "user", "content": "one"},
            {"role": "user", "content": "two"}
        ]
    });
    let response = h
        .app
        .clone()
        .oneshot(post_json("/v1/chat/completions", Some(&token_for(7)), &body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let envelope = read_json(response).await;
    assert_eq!(envelope["error"]["code"], "1001");
}

#[tokio::test]
async fn unreachable_backend_is_a_bad_gateway() {
    let h = harness("http://127.0.0.1:9".to_string()).await;
    let body = json!({"model": "gpt-4o", "messages": [{"role": "user", "content": "hi"}]});
    let response = h
        .app
        .clone()
        .oneshot(post_json("/v1/chat/completions", Some(&token_for(7)), &body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let envelope = read_json(response).await;
    assert_eq!(envelope["error"]["type"], "bad_gateway");
    assert!(!envelope.to_string().contains("127.0.0.1"));
}

#[tokio::test]
async fn non_post_chat_calls_are_forwarded_without_a_conversation() {
    if should_skip_httpmock() {
        return;
    }
    let upstream = MockServer::start();
    let mock = upstream.mock(|when, then| {
        when.method(GET)
            .path("/v1/chat/completions")
            .header("x-user-id", "13");
        then.status(405)
            .header("content-type", "application/json")
            .body(r#"{"error":{"message":"method not allowed"}}"#);
    });
    let h = harness(upstream.base_url()).await;

    let response = h
        .app
        .clone()
        .oneshot(get("/v1/chat/completions", &token_for(13)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    assert!(!response.headers().contains_key("x-conversation-id"));
    let _ = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    mock.assert();

    let usage = h.store.list_usage(13).await.expect("usage");
    assert_eq!(usage.len(), 1);
    assert_eq!(usage[0].method, "GET");
    assert_eq!(usage[0].error_message.as_deref(), Some("method not allowed"));
}
