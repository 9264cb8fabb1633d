//! HTTP handlers translating gate and orchestrator results.

pub mod mfa;
pub mod status;

use axum::extract::{FromRequest, Request};
use axum::{Json, RequestExt};
use serde::de::DeserializeOwned;
use validator::Validate;

use crate::AppState;
use crate::error::ServerError;

/// JSON extractor running `validator` checks before the handler sees the
/// body.
pub struct Valid<T>(pub T);

impl<T> FromRequest<AppState> for Valid<T>
where
    T: DeserializeOwned + Validate + 'static,
{
    type Rejection = ServerError;

    async fn from_request(
        req: Request,
        _state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let Json(body) = req.extract::<Json<T>, _>().await?;
        body.validate()?;
        Ok(Valid(body))
    }
}
