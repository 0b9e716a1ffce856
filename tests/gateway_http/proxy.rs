#[tokio::test]
async fn other_v1_paths_are_relayed_with_the_caller_identity() {
    if should_skip_httpmock() {
        return;
    }
    let upstream = MockServer::start();
    let mock = upstream.mock(|when, then| {
        when.method(GET)
            .path("/v1/models")
            .query_param("limit", "5")
            .header("x-user-id", "21");
        then.status(200)
            .header("content-type", "application/json")
            .body(r#"{"object":"list","data":[{"id":"gpt-4o"}]}"#);
    });
    let h = harness(upstream.base_url()).await;

    let request = Request::builder()
        .method("GET")
        .uri(format!("/v1/models?limit=5&token={}", token_for(21)))
        .body(Body::empty())
        .unwrap();
    let response = h.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(!response.headers().contains_key("x-conversation-id"));
    let body = read_json(response).await;
    assert_eq!(body["data"][0]["id"], "gpt-4o");
    mock.assert();

    let usage = h.store.list_usage(21).await.expect("usage");
    assert_eq!(usage.len(), 1);
    assert_eq!(usage[0].endpoint, "/v1/models");
    assert_eq!(usage[0].method, "GET");
}

#[tokio::test]
async fn proxy_relays_backend_errors_verbatim() {
    if should_skip_httpmock() {
        return;
    }
    let upstream = MockServer::start();
    let mock = upstream.mock(|when, then| {
        when.method(POST).path("/v1/embeddings");
        then.status(400)
            .header("content-type", "application/json")
            .body(r#"{"error":{"message":"bad input"}}"#);
    });
    let h = harness(upstream.base_url()).await;

    let response = h
        .app
        .clone()
        .oneshot(post_json(
            "/v1/embeddings",
            Some(&token_for(3)),
            &json!({"model": "text-embedding-3-small", "input": ""}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = read_json(response).await;
    assert_eq!(body["error"]["message"], "bad input");
    mock.assert();

    let usage = h.store.list_usage(3).await.expect("usage");
    assert_eq!(usage[0].status, 400);
    assert_eq!(usage[0].error_message.as_deref(), Some("bad input"));
}

#[tokio::test]
async fn proxy_requires_authentication() {
    if should_skip_httpmock() {
        return;
    }
    let upstream = MockServer::start();
    let mock = upstream.mock(|when, then| {
        when.path("/v1/models");
        then.status(200).body("{}");
    });
    let h = harness(upstream.base_url()).await;

    let request = Request::builder()
        .method("GET")
        .uri("/v1/models")
        .body(Body::empty())
        .unwrap();
    let response = h.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    mock.assert_hits(0);
}

#[tokio::test]
async fn tokens_outside_the_device_window_are_refused() {
    if should_skip_httpmock() {
        return;
    }
    let upstream = MockServer::start();
    let mock = upstream.mock(|when, then| {
        when.path("/v1/models");
        then.status(200).body("{}");
    });
    let h = harness(upstream.base_url()).await;
    h.versions.set(5, 4);

    let response = h
        .app
        .clone()
        .oneshot(get("/v1/models", &token_with_version(5, 1)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let envelope = read_json(response).await;
    assert_eq!(envelope["error"]["message"], "login device limit reached");

    let response = h
        .app
        .clone()
        .oneshot(get("/v1/models", &token_with_version(5, 3)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let _ = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    mock.assert_hits(1);
}
