async fn handle_chat_completions(
    State(state): State<GatewayHttpState>,
    req: Request<Body>,
) -> Response {
    run_pipeline(&state, &state.chat, req).await
}
