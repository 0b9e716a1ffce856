/// Every other `/v1` endpoint: authenticated, then relayed as-is.
async fn handle_proxy(State(state): State<GatewayHttpState>, req: Request<Body>) -> Response {
    run_pipeline(&state, &state.proxy, req).await
}
