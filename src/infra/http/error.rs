use axum::Json;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::application::error::ErrorReport;

#[derive(Debug, Serialize)]
pub struct ApiErrorBody {
    pub error: ApiErrorMessage,
}

pub mod codes {
    pub const BAD_REQUEST: &str = "bad_request";
    pub const INVALID_INPUT: &str = "invalid_input";
}

#[derive(Debug, Serialize)]
pub struct ApiErrorMessage {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: &'static str,
    hint: Option<String>,
}

impl ApiError {
    pub fn new(
        status: StatusCode,
        code: &'static str,
        message: &'static str,
        hint: Option<String>,
    ) -> Self {
        Self {
            status,
            code,
            message,
            hint,
        }
    }

    pub fn bad_request(message: &'static str, hint: Option<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, codes::BAD_REQUEST, message, hint)
    }

    pub fn invalid_input(message: &'static str, hint: Option<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, codes::INVALID_INPUT, message, hint)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::new(
            rejection.status(),
            codes::BAD_REQUEST,
            "invalid request body",
            Some(rejection.body_text()),
        )
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::bad_request("invalid query string", Some(rejection.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let hint = self.hint.clone();
        let body = ApiErrorBody {
            error: ApiErrorMessage {
                code: self.code.to_string(),
                message: self.message.to_string(),
                hint: self.hint,
            },
        };
        let mut response = (self.status, Json(body)).into_response();
        ErrorReport::from_message(
            "infra::http::operator",
            self.status,
            format!("{}: {}", self.code, hint.as_deref().unwrap_or(self.message)),
        )
        .attach(&mut response);
        response
    }
}
