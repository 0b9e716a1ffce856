#[derive(Debug, Default, Deserialize)]
struct UsageStatsRequest {
    #[serde(default)]
    date: Option<String>,
}

async fn handle_usage_total(
    State(state): State<GatewayHttpState>,
    headers: HeaderMap,
    uri: Uri,
) -> Response {
    let claims = match authenticate(&state, &headers, &uri).await {
        Ok(claims) => claims,
        Err(err) => return err.into_response(),
    };
    match state.usage.totals(claims.user_id).await {
        Ok(totals) => envelope::success(totals),
        Err(err) => store_error(err).into_response(),
    }
}

async fn handle_usage_stats(
    State(state): State<GatewayHttpState>,
    headers: HeaderMap,
    uri: Uri,
    body: Bytes,
) -> Response {
    let result = async {
        let claims = authenticate(&state, &headers, &uri).await?;
        let request = if body.iter().all(u8::is_ascii_whitespace) {
            UsageStatsRequest::default()
        } else {
            serde_json::from_slice::<UsageStatsRequest>(&body).map_err(|err| {
                ApiError::invalid_param("request body must be a JSON object").with_details(err)
            })?
        };
        let date = match request.date.as_deref().map(str::trim).filter(|raw| !raw.is_empty()) {
            None => state.usage.today(),
            Some(raw) => parse_date(raw).ok_or_else(|| {
                ApiError::invalid_param("date must be formatted as YYYY-MM-DD").with_param("date")
            })?,
        };
        state
            .usage
            .daily(claims.user_id, date)
            .await
            .map_err(store_error)
    }
    .await;

    match result {
        Ok(daily) => envelope::success(daily),
        Err(err) => err.into_response(),
    }
}
