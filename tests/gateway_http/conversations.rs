async fn seed_conversation(store: &SqliteStore, id: i64, user_id: i64, at_ms: i64) {
    store
        .create_conversation(NewConversation {
            id,
            user_id,
            title: format!("chat {id}"),
            model: "gpt-4o".to_string(),
            created_at_ms: at_ms,
        })
        .await
        .expect("create");
}

#[tokio::test]
async fn conversations_are_listed_newest_first_and_paginated() {
    let h = harness("http://127.0.0.1:9".to_string()).await;
    seed_conversation(&h.store, 101, 7, 1_000).await;
    seed_conversation(&h.store, 102, 7, 3_000).await;
    seed_conversation(&h.store, 103, 7, 2_000).await;
    seed_conversation(&h.store, 104, 8, 4_000).await;
    let token = token_for(7);

    let response = h
        .app
        .clone()
        .oneshot(get("/v1/conversations?page=1&page_size=2", &token))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let envelope = read_json(response).await;
    assert_eq!(envelope["success"], true);
    let data = &envelope["data"];
    assert_eq!(data["total"], 3);
    assert_eq!(data["page"], 1);
    assert_eq!(data["page_size"], 2);
    let ids: Vec<i64> = data["list"]
        .as_array()
        .expect("list")
        .iter()
        .map(|item| item["conversation_id"].as_i64().expect("id"))
        .collect();
    assert_eq!(ids, [102, 103]);
    assert_eq!(data["list"][0]["last_message_at"], "1970-01-01T00:00:03Z");

    let response = h
        .app
        .clone()
        .oneshot(get("/v1/conversations?page=2&page_size=2", &token))
        .await
        .unwrap();
    let envelope = read_json(response).await;
    assert_eq!(envelope["data"]["list"][0]["conversation_id"], 101);
}

#[tokio::test]
async fn conversation_paging_rejects_bad_values_and_clamps_size() {
    let h = harness("http://127.0.0.1:9".to_string()).await;
    let token = token_for(7);

    let response = h
        .app
        .clone()
        .oneshot(get("/v1/conversations?page=0", &token))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(read_json(response).await["error"]["code"], "1001");

    let response = h
        .app
        .clone()
        .oneshot(get("/v1/conversations?page_size=lots", &token))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = h
        .app
        .clone()
        .oneshot(get("/v1/conversations?page_size=5000", &token))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(read_json(response).await["data"]["page_size"], 100);
}

#[tokio::test]
async fn conversation_messages_are_scoped_to_the_owner() {
    if should_skip_httpmock() {
        return;
    }
    let upstream = MockServer::start();
    upstream.mock(|when, then| {
        when.method(POST).path("/v1/chat/completions");
        then.status(200)
            .header("content-type", "application/json")
            .body(r#"{"model":"gpt-4o","choices":[{"message":{"content":"pong"}}]}"#);
    });
    let h = harness(upstream.base_url()).await;
    let token = token_for(7);

    let body = json!({
        "model": "gpt-4o",
        "messages": [
            {"role": "user", "content": "ping"},
            {"role": "system", "content": "answer tersely"}
        ]
    });
    let response = h
        .app
        .clone()
        .oneshot(post_json("/v1/chat/completions", Some(&token), &body))
        .await
        .unwrap();
    let conversation_id = conversation_header(&response);
    let _ = to_bytes(response.into_body(), usize::MAX).await.unwrap();

    let uri = format!("/v1/conversations/{conversation_id}/messages");
    let response = h.app.clone().oneshot(get(&uri, &token)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let envelope = read_json(response).await;
    let data = &envelope["data"];
    assert_eq!(data["conversation"]["conversation_id"], conversation_id);
    assert_eq!(data["conversation"]["message_count"], 3);
    assert_eq!(data["total"], 3);
    let roles: Vec<&str> = data["messages"]
        .as_array()
        .expect("messages")
        .iter()
        .map(|message| message["role"].as_str().expect("role"))
        .collect();
    assert_eq!(roles, ["system", "user", "assistant"]);
    assert_eq!(data["messages"][2]["content"], "pong");

    let response = h
        .app
        .clone()
        .oneshot(get(&uri, &token_for(8)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = h
        .app
        .clone()
        .oneshot(get("/v1/conversations/abc/messages", &token))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
