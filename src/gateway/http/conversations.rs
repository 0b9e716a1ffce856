#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PageRequest {
    page: u64,
    page_size: u64,
}

impl PageRequest {
    fn from_query(
        params: &HashMap<String, String>,
        default_size: u32,
        max_size: u32,
    ) -> Result<Self, ApiError> {
        let page = parse_positive(params, "page", 1)?;
        let page_size = parse_positive(params, "page_size", u64::from(default_size.max(1)))?
            .min(u64::from(max_size.max(1)));
        Ok(Self { page, page_size })
    }

    fn offset(self) -> u64 {
        (self.page - 1).saturating_mul(self.page_size)
    }
}

fn parse_positive(
    params: &HashMap<String, String>,
    name: &str,
    default: u64,
) -> Result<u64, ApiError> {
    let Some(raw) = params.get(name).map(|value| value.trim()) else {
        return Ok(default);
    };
    match raw.parse::<i64>() {
        Ok(value) if value > 0 => Ok(value.unsigned_abs()),
        _ => Err(ApiError::invalid_param(format!("{name} must be a positive integer"))
            .with_param(name)),
    }
}

#[derive(Debug, Serialize)]
struct ConversationView {
    conversation_id: i64,
    title: String,
    model: String,
    message_count: i64,
    last_message_preview: String,
    last_message_at: String,
}

impl From<ConversationRecord> for ConversationView {
    fn from(record: ConversationRecord) -> Self {
        Self {
            conversation_id: record.id,
            title: record.title,
            model: record.model,
            message_count: record.message_count,
            last_message_preview: record.last_message_preview,
            last_message_at: format_timestamp_ms(record.last_message_at_ms),
        }
    }
}

#[derive(Debug, Serialize)]
struct MessageView {
    message_id: i64,
    role: String,
    content: String,
    model: String,
    created_at: String,
    updated_at: String,
}

impl From<MessageRecord> for MessageView {
    fn from(record: MessageRecord) -> Self {
        Self {
            message_id: record.id,
            role: record.role,
            content: record.content,
            model: record.model,
            created_at: format_timestamp_ms(record.created_at_ms),
            updated_at: format_timestamp_ms(record.updated_at_ms),
        }
    }
}

#[derive(Debug, Serialize)]
struct ConversationList {
    list: Vec<ConversationView>,
    page: u64,
    page_size: u64,
    total: u64,
}

#[derive(Debug, Serialize)]
struct ConversationMessages {
    conversation: ConversationView,
    messages: Vec<MessageView>,
    page: u64,
    page_size: u64,
    total: u64,
}

async fn handle_list_conversations(
    State(state): State<GatewayHttpState>,
    headers: HeaderMap,
    uri: Uri,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let result = async {
        let claims = authenticate(&state, &headers, &uri).await?;
        let paging = PageRequest::from_query(
            &params,
            state.pagination.default_page_size,
            state.pagination.max_page_size,
        )?;
        let page = state
            .store
            .list_conversations(claims.user_id, paging.offset(), paging.page_size)
            .await
            .map_err(store_error)?;
        Ok::<_, ApiError>(ConversationList {
            list: page.items.into_iter().map(ConversationView::from).collect(),
            page: paging.page,
            page_size: paging.page_size,
            total: page.total,
        })
    }
    .await;

    match result {
        Ok(list) => envelope::success(list),
        Err(err) => err.into_response(),
    }
}

async fn handle_list_conversation_messages(
    State(state): State<GatewayHttpState>,
    headers: HeaderMap,
    uri: Uri,
    Path(raw_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let result = async {
        let claims = authenticate(&state, &headers, &uri).await?;
        let conversation_id = raw_id
            .trim()
            .parse::<i64>()
            .ok()
            .filter(|id| *id > 0)
            .ok_or_else(|| {
                ApiError::invalid_param("conversation_id must be a positive integer")
                    .with_param("conversation_id")
            })?;
        let paging = PageRequest::from_query(
            &params,
            state.pagination.default_message_page_size,
            state.pagination.max_message_page_size,
        )?;

        let conversation = state
            .store
            .get_conversation(conversation_id, claims.user_id)
            .await
            .map_err(store_error)?
            .ok_or_else(|| ApiError::not_found("conversation not found"))?;
        let page = state
            .store
            .list_messages(conversation_id, paging.offset(), paging.page_size)
            .await
            .map_err(store_error)?;

        Ok::<_, ApiError>(ConversationMessages {
            conversation: conversation.into(),
            messages: page.items.into_iter().map(MessageView::from).collect(),
            page: paging.page,
            page_size: paging.page_size,
            total: page.total,
        })
    }
    .await;

    match result {
        Ok(messages) => envelope::success(messages),
        Err(err) => err.into_response(),
    }
}
