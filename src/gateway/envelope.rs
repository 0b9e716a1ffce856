use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};

/// Machine-readable status codes carried in `error.code`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatCode {
    InvalidParam,
    Unauthorized,
    Forbidden,
    NotFound,
    Conflict,
    TooManyRequests,
    Internal,
    Database,
}

impl StatCode {
    pub fn code(self) -> u16 {
        match self {
            Self::InvalidParam => 1001,
            Self::Unauthorized => 1002,
            Self::Forbidden => 1003,
            Self::NotFound => 1004,
            Self::Conflict => 1005,
            Self::TooManyRequests => 1006,
            Self::Internal => 2000,
            Self::Database => 2001,
        }
    }

    pub fn error_type(self) -> &'static str {
        match self {
            Self::InvalidParam | Self::NotFound | Self::Conflict => "invalid_request_error",
            Self::Unauthorized => "authentication_error",
            Self::Forbidden => "permission_error",
            Self::TooManyRequests => "rate_limit_error",
            Self::Internal | Self::Database => "server_error",
        }
    }

    pub fn text(self) -> &'static str {
        match self {
            Self::InvalidParam => "invalid params",
            Self::Unauthorized => "unauthorized",
            Self::Forbidden => "forbidden",
            Self::NotFound => "not found",
            Self::Conflict => "conflict",
            Self::TooManyRequests => "too many requests",
            Self::Internal => "internal error",
            Self::Database => "database error",
        }
    }

    pub fn http_status(self) -> StatusCode {
        match self {
            Self::InvalidParam => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Conflict => StatusCode::CONFLICT,
            Self::TooManyRequests => StatusCode::TOO_MANY_REQUESTS,
            Self::Internal | Self::Database => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiErrorBody {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub param: Option<String>,
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApiEnvelope<T> {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiErrorBody>,
}

pub fn success<T: Serialize>(data: T) -> Response {
    (
        StatusCode::OK,
        Json(ApiEnvelope {
            success: true,
            data: Some(data),
            error: None,
        }),
    )
        .into_response()
}

#[derive(Clone, Debug)]
pub struct ApiError {
    status: StatusCode,
    stat: StatCode,
    message: String,
    param: Option<String>,
    details: Option<String>,
}

impl ApiError {
    pub fn new(stat: StatCode, message: impl Into<String>) -> Self {
        let message = message.into();
        let message = if message.trim().is_empty() {
            stat.text().to_string()
        } else {
            message
        };
        Self {
            status: stat.http_status(),
            stat,
            message,
            param: None,
            details: None,
        }
    }

    pub fn invalid_param(message: impl Into<String>) -> Self {
        Self::new(StatCode::InvalidParam, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatCode::Unauthorized, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatCode::NotFound, message)
    }

    pub fn database(message: impl Into<String>) -> Self {
        Self::new(StatCode::Database, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatCode::Internal, message)
    }

    pub fn with_param(mut self, param: impl Into<String>) -> Self {
        self.param = Some(param.into());
        self
    }

    pub fn with_details(mut self, details: impl std::fmt::Display) -> Self {
        self.details = Some(details.to_string());
        self
    }

    pub fn stat(&self) -> StatCode {
        self.stat
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn body(&self) -> ApiErrorBody {
        ApiErrorBody {
            message: self.message.clone(),
            kind: self.stat.error_type().to_string(),
            param: self.param.clone(),
            code: self.stat.code().to_string(),
            details: self.details.clone(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = self.body();
        (
            self.status,
            Json(ApiEnvelope::<()> {
                success: false,
                data: None,
                error: Some(body),
            }),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_body_carries_stat_code_and_type() {
        let err = ApiError::new(StatCode::TooManyRequests, "rate limit exceeded")
            .with_details("dimension=token");
        let body = serde_json::to_value(ApiEnvelope::<()> {
            success: false,
            data: None,
            error: Some(err.body()),
        })
        .expect("json");
        assert_eq!(err.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            body,
            serde_json::json!({
                "success": false,
                "error": {
                    "message": "rate limit exceeded",
                    "type": "rate_limit_error",
                    "code": "1006",
                    "details": "dimension=token",
                }
            })
        );
    }

    #[test]
    fn blank_message_uses_stat_text() {
        let err = ApiError::new(StatCode::NotFound, " ");
        assert_eq!(err.body().message, "not found");
        assert_eq!(err.body().kind, "invalid_request_error");
    }
}
