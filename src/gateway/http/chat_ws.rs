async fn handle_chat_ws(
    State(state): State<GatewayHttpState>,
    headers: HeaderMap,
    uri: Uri,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let claims = match authenticate(&state, &headers, &uri).await {
        Ok(claims) => claims,
        Err(err) => return err.into_response(),
    };
    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => return rejection.into_response(),
    };

    tracing::info!(user_id = claims.user_id, "chat websocket connected");
    let fanout = Arc::clone(&state.fanout);
    let user_id = claims.user_id;
    upgrade.on_upgrade(move |socket| fanout.serve(socket, user_id))
}
