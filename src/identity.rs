//! External identity boundary.
//!
//! Primary authentication happens upstream; the gate only consumes its
//! result. The reverse proxy (or host application) forwards the resolved
//! principal through trusted headers, which must be stripped from
//! client-supplied requests at the edge.

use axum::extract::FromRequestParts;
use axum::http::HeaderMap;
use axum::http::request::Parts;

use crate::error::ServerError;

pub const PRINCIPAL_HEADER: &str = "x-principal-id";
pub const EMAIL_HEADER: &str = "x-principal-email";

/// An already-authenticated principal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Opaque principal id.
    pub id: String,
    /// Address for out-of-band code delivery.
    pub email: String,
}

impl Identity {
    /// Read the identity the upstream authenticator attached, if any.
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let id = headers.get(PRINCIPAL_HEADER)?.to_str().ok()?;
        if id.is_empty() {
            return None;
        }
        let email = headers
            .get(EMAIL_HEADER)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();

        Some(Self {
            id: id.to_owned(),
            email: email.to_owned(),
        })
    }
}

impl<S> FromRequestParts<S> for Identity
where
    S: Send + Sync,
{
    type Rejection = ServerError;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> Result<Self, Self::Rejection> {
        Identity::from_headers(&parts.headers)
            .ok_or(ServerError::Unauthenticated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_from_headers() {
        let mut headers = HeaderMap::new();
        assert!(Identity::from_headers(&headers).is_none());

        headers.insert(PRINCIPAL_HEADER, HeaderValue::from_static("u1"));
        headers
            .insert(EMAIL_HEADER, HeaderValue::from_static("u1@example.org"));
        let identity = Identity::from_headers(&headers).unwrap();
        assert_eq!(identity.id, "u1");
        assert_eq!(identity.email, "u1@example.org");
    }

    #[test]
    fn test_empty_principal_is_absent() {
        let mut headers = HeaderMap::new();
        headers.insert(PRINCIPAL_HEADER, HeaderValue::from_static(""));
        assert!(Identity::from_headers(&headers).is_none());
    }
}
