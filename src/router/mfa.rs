//! Enrollment and challenge endpoints.
//!
//! Thin translations from orchestrator results to HTTP: the actual flow
//! sequencing lives in [`crate::mfa`].

use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::{Json, Router, routing};
use serde::{Deserialize, Serialize};
use validator::Validate;

use super::Valid;
use crate::AppState;
use crate::error::{Result, ServerError};
use crate::identity::Identity;
use crate::registry::Method;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/method", routing::get(method))
        .route("/totp/start", routing::post(totp_start))
        .route("/totp/verify", routing::post(totp_verify))
        .route("/totp", routing::delete(totp_unenroll))
        .route("/email/start", routing::post(email_start))
        .route("/email/verify", routing::post(email_verify))
        .route("/email", routing::delete(email_unenroll))
}

/// Six ASCII digits, exactly.
fn validate_code(code: &str) -> std::result::Result<(), validator::ValidationError> {
    if code.len() == 6 && code.bytes().all(|b| b.is_ascii_digit()) {
        Ok(())
    } else {
        Err(validator::ValidationError::new("code"))
    }
}

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct CodeBody {
    #[validate(custom(
        function = "validate_code",
        message = "Code must be 6 digits."
    ))]
    pub code: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MethodResponse {
    pub method: Method,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TotpStartResponse {
    pub factor_ref: String,
    pub otpauth_uri: String,
}

async fn method(
    State(state): State<AppState>,
    identity: Identity,
) -> Result<Json<MethodResponse>> {
    let method =
        state.orchestrator.registry.get_method(&identity.id).await?;
    Ok(Json(MethodResponse { method }))
}

async fn totp_start(
    State(state): State<AppState>,
    identity: Identity,
) -> Result<(StatusCode, Json<TotpStartResponse>)> {
    let factor = state.orchestrator.start_totp_enroll(&identity).await?;
    Ok((
        StatusCode::CREATED,
        Json(TotpStartResponse {
            factor_ref: factor.factor_ref,
            otpauth_uri: factor.otpauth_uri,
        }),
    ))
}

async fn totp_verify(
    State(state): State<AppState>,
    identity: Identity,
    Valid(body): Valid<CodeBody>,
) -> Result<StatusCode> {
    state.orchestrator.verify_totp(&identity, &body.code).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn totp_unenroll(
    State(state): State<AppState>,
    identity: Identity,
) -> Result<StatusCode> {
    state.orchestrator.unenroll_totp(&identity).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn email_start(
    State(state): State<AppState>,
    identity: Identity,
) -> Result<StatusCode> {
    state.orchestrator.start_email(&identity).await?;
    Ok(StatusCode::ACCEPTED)
}

async fn email_verify(
    State(state): State<AppState>,
    identity: Identity,
    Valid(body): Valid<CodeBody>,
) -> Result<(HeaderMap, StatusCode)> {
    let verified =
        state.orchestrator.verify_email(&identity, &body.code).await?;

    let mut headers = HeaderMap::new();
    headers.insert(
        header::SET_COOKIE,
        HeaderValue::from_str(&verified.cookie).map_err(|err| {
            ServerError::Internal {
                details: "proof cookie is not a valid header value".into(),
                source: Some(Box::new(err)),
            }
        })?,
    );

    let status = if verified.enrolled {
        StatusCode::CREATED
    } else {
        StatusCode::NO_CONTENT
    };
    Ok((headers, status))
}

async fn email_unenroll(
    State(state): State<AppState>,
    identity: Identity,
) -> Result<(HeaderMap, StatusCode)> {
    let cookie = state.orchestrator.unenroll_email(&identity).await?;

    let mut headers = HeaderMap::new();
    headers.insert(
        header::SET_COOKIE,
        HeaderValue::from_str(&cookie).map_err(|err| {
            ServerError::Internal {
                details: "proof cookie is not a valid header value".into(),
                source: Some(Box::new(err)),
            }
        })?,
    );

    Ok((headers, StatusCode::NO_CONTENT))
}
