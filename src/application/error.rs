use std::error::Error as StdError;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::{cache::CacheError, config::LoadError, infra::error::InfraError};

/// Diagnostic chain attached to error responses for the logging middleware.
#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub source: &'static str,
    pub status: StatusCode,
    pub messages: Vec<String>,
}

impl ErrorReport {
    pub fn from_error(source: &'static str, status: StatusCode, error: &dyn StdError) -> Self {
        let mut messages = Vec::new();
        messages.push(error.to_string());
        let mut current = error.source();
        while let Some(inner) = current {
            messages.push(inner.to_string());
            current = inner.source();
        }
        Self {
            source,
            status,
            messages,
        }
    }

    pub fn from_message(
        source: &'static str,
        status: StatusCode,
        message: impl Into<String>,
    ) -> Self {
        Self {
            source,
            status,
            messages: vec![message.into()],
        }
    }

    pub fn attach(self, response: &mut Response) {
        response.extensions_mut().insert(self);
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error(transparent)]
    Config(#[from] LoadError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(message.into())
    }

    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Cache(CacheError::Producer(_)) => StatusCode::BAD_GATEWAY,
            AppError::Cache(CacheError::Aborted { .. }) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Cache(_)
            | AppError::Config(_)
            | AppError::Infra(_)
            | AppError::Unexpected(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn presentation_message(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "Request could not be processed",
            AppError::Cache(CacheError::Producer(_)) => "Upstream data source failed",
            AppError::Cache(CacheError::Aborted { .. }) => "Service temporarily unavailable",
            AppError::Cache(_) => "Cache failure during request",
            AppError::Config(_) | AppError::Infra(InfraError::Configuration { .. }) => {
                "Service misconfigured"
            }
            AppError::Infra(InfraError::Telemetry(_)) => "Logging subsystem could not start",
            AppError::Infra(InfraError::Io(_)) => "I/O failure during request",
            AppError::Unexpected(_) => "Unexpected error occurred",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = self.presentation_message();
        let report = ErrorReport::from_error("application::error::AppError", status, &self);
        let mut response = (status, message).into_response();
        report.attach(&mut response);
        response
    }
}
