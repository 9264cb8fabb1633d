//! Error handler for authgate.

use axum::extract::rejection::JsonRejection;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use sqlx::Error as SQLxError;
use thiserror::Error;
use validator::ValidationErrors;

pub type Result<T> = std::result::Result<T, ServerError>;

/// Enum representing server-side errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("validation error occurred")]
    Validation(#[from] ValidationErrors),

    #[error(transparent)]
    Axum(#[from] JsonRejection),

    #[error("SQL request failed: {0}")]
    Sql(#[from] SQLxError),

    #[error("invalid URL")]
    Url(#[from] url::ParseError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("no authenticated identity on request")]
    Unauthenticated,

    #[error("multi-factor enrollment required")]
    EnrollmentRequired,

    #[error("multi-factor verification required")]
    ChallengeRequired,

    /// Wrong, reused or expired one-time code, or a malformed, expired or
    /// tampered session proof. Sub-causes are deliberately not
    /// distinguished to prevent enumeration.
    #[error("invalid or expired code")]
    InvalidOrExpiredCode,

    #[error("rate limit exceeded. Try again in {retry_in}s.")]
    RateLimited { retry_in: u64 },

    #[error("out-of-band code delivery failed")]
    DeliveryFailed,

    #[error("no factor of the requested kind is enrolled")]
    NotEnrolled,

    #[error("a factor of this kind is already enrolled")]
    FactorExists,

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("internal server error, {details}")]
    Internal {
        details: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

/// Structure for detailed error responses.
#[derive(Debug, Serialize)]
pub struct ResponseError {
    r#type: Option<String>,
    title: String,
    status: u16,
    detail: String,
    instance: Option<String>,
    errors: Option<Vec<FieldError>>,
    /// Machine-readable message some clients key on.
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip)]
    retry_after: Option<u64>,
}

impl ResponseError {
    /// Update error status code.
    pub fn status(mut self, code: StatusCode) -> Self {
        self.status = code.as_u16();
        self
    }

    /// Update `title` field.
    pub fn title(mut self, title: &str) -> Self {
        self.title = title.into();
        self
    }

    /// Add detailed error.
    pub fn details(mut self, description: &str) -> Self {
        self.detail = description.into();
        self
    }

    /// Automatically add errors field.
    pub fn errors(mut self, errors: &ValidationErrors) -> Self {
        self.errors = Some(parse_validation_errors(errors));
        self
    }

    /// Set the top-level `error` message field.
    pub fn error(mut self, message: &str) -> Self {
        self.error = Some(message.into());
        self
    }

    /// Add a `Retry-After` header to the response.
    pub fn retry_after(mut self, seconds: u64) -> Self {
        self.retry_after = Some(seconds);
        self
    }

    /// Transform [`ResponseError`] into axum [`Response`].
    pub fn into_response(
        self,
    ) -> std::result::Result<Response, axum::http::Error> {
        if let Ok(body) = serde_json::to_string(&self) {
            let mut builder = Response::builder()
                .status(self.status)
                .header(header::CONTENT_TYPE, "application/json");
            if let Some(seconds) = self.retry_after {
                builder = builder.header(header::RETRY_AFTER, seconds);
            }
            builder.body(body.into())
        } else {
            Ok(internal_server_error())
        }
    }
}

impl Default for ResponseError {
    fn default() -> Self {
        Self {
            r#type: None,
            title: "Internal server error.".to_owned(),
            status: StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
            detail: String::default(),
            instance: None,
            errors: None,
            error: None,
            retry_after: None,
        }
    }
}

#[derive(Debug, Serialize)]
struct FieldError {
    field: String,
    message: String,
}

fn parse_validation_errors(errors: &ValidationErrors) -> Vec<FieldError> {
    errors
        .field_errors()
        .iter()
        .flat_map(|(field, issues)| {
            issues.iter().map(move |issue| FieldError {
                field: field.to_string(),
                message: issue.to_string(),
            })
        })
        .collect()
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let response = ResponseError::default()
            .title("There were validation errors with your request.")
            .details(&self.to_string())
            .status(StatusCode::BAD_REQUEST);

        let response = match &self {
            ServerError::Validation(validation_errors) => {
                response.errors(validation_errors)
            },

            ServerError::Unauthenticated => response
                .title("No authenticated identity.")
                .status(StatusCode::UNAUTHORIZED),

            ServerError::EnrollmentRequired => response
                .title("MFA enrollment required.")
                .status(StatusCode::FORBIDDEN),

            ServerError::ChallengeRequired => response
                .title("MFA verification required.")
                .status(StatusCode::FORBIDDEN),

            ServerError::InvalidOrExpiredCode | ServerError::NotEnrolled => {
                response
                    .title("Invalid or expired code.")
                    .details("invalid or expired code")
                    .status(StatusCode::FORBIDDEN)
            },

            ServerError::RateLimited { retry_in } => {
                let message =
                    format!("Rate limit exceeded. Try again in {retry_in}s.");
                response
                    .title("Rate limit exceeded.")
                    .details(&message)
                    .error(&message)
                    .status(StatusCode::TOO_MANY_REQUESTS)
                    .retry_after(*retry_in)
            },

            ServerError::FactorExists => response
                .title("A factor is already enrolled.")
                .status(StatusCode::CONFLICT),

            ServerError::DeliveryFailed => response
                .title("Could not deliver the verification code.")
                .status(StatusCode::BAD_GATEWAY),

            ServerError::Sql(err) => {
                tracing::error!(error = %err, "sql request failed");
                ResponseError::default()
            },

            ServerError::Configuration(details) => {
                tracing::error!(%details, "configuration error");
                ResponseError::default()
            },

            ServerError::Internal { details, source } => {
                tracing::error!(err = ?source, %details, "server returned 500 status");

                ResponseError::default()
            },

            _ => response,
        };

        response
            .into_response()
            .unwrap_or_else(|_| internal_server_error())
    }
}

fn internal_server_error() -> Response {
    Response::builder()
        .status(StatusCode::INTERNAL_SERVER_ERROR)
        .header(header::CONTENT_TYPE, "application/json")
        .body(
            serde_json::json!({
                "type": null,
                "title": "Internal server error.",
                "status": StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
                "detail": null,
                "instance": null,
                "errors": null,
            })
            .to_string()
            .into(),
        )
        .unwrap_or_else(|_| Response::new("Internal server error".into()))
}
