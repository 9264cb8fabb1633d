//! Per-request step-up authorization gate.
//!
//! One pure decision function consumed by every entry point; the
//! middleware only resolves its inputs and translates the returned
//! decision into a redirect or a JSON error.

use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::AppState;
use crate::error::{Result, ServerError};
use crate::identity::Identity;
use crate::registry::Method;
use crate::totp::Assurance;

pub const ENROLL_ROUTE: &str = "/auth/mfa/enroll";
pub const CHALLENGE_ROUTE: &str = "/auth/mfa/challenge";
const LOGIN_ROUTE: &str = "/login";
const API_PREFIX: &str = "/api/";

/// Routes reachable without any identity.
const PUBLIC_ROUTES: &[&str] = &["/login", "/signup", "/status.json"];
const PUBLIC_PREFIX: &str = "/auth/public/";

/// What the caller must do with the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    RedirectEnroll,
    RedirectChallenge,
    RedirectLogin,
    Deny(StatusCode),
}

/// Classification of the requested path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathClass {
    pub public: bool,
    pub api: bool,
    /// Path already targets the enrollment flow.
    pub enroll_target: bool,
    /// Path already targets the challenge flow.
    pub challenge_target: bool,
}

impl PathClass {
    pub fn of(path: &str) -> Self {
        // Only the verification endpoints double as flow targets:
        // blocking them would deadlock enrollment or challenges. Factor
        // resets (`totp/start` while enrolled) and the unenroll routes
        // stay behind a full Allow, otherwise a stolen primary session
        // could replace or strip the enrolled factor.
        let verification = matches!(
            path,
            "/auth/mfa/totp/verify"
                | "/auth/mfa/email/start"
                | "/auth/mfa/email/verify"
        );
        let enroll_target = path == ENROLL_ROUTE
            || path == "/auth/mfa/totp/start"
            || path == "/auth/mfa/method"
            || verification;
        let challenge_target = path == CHALLENGE_ROUTE
            || path == "/auth/mfa/method"
            || verification;

        Self {
            public: PUBLIC_ROUTES.contains(&path)
                || path.starts_with(PUBLIC_PREFIX),
            api: path.starts_with(API_PREFIX),
            enroll_target,
            challenge_target,
        }
    }
}

/// Decision table, evaluated top-down, first match wins.
pub fn decide(
    identity: Option<&Identity>,
    method: Method,
    assurance: Assurance,
    proof_ok: bool,
    path: PathClass,
) -> Decision {
    if identity.is_none() {
        if path.public {
            return Decision::Allow;
        }
        return if path.api {
            Decision::Deny(StatusCode::UNAUTHORIZED)
        } else {
            Decision::RedirectLogin
        };
    }

    match method {
        Method::Totp => match assurance {
            Assurance::Elevated => Decision::Allow,
            Assurance::Password if path.challenge_target => Decision::Allow,
            Assurance::Password => Decision::RedirectChallenge,
        },
        Method::Email if proof_ok => Decision::Allow,
        Method::Email if path.challenge_target => Decision::Allow,
        Method::Email => Decision::RedirectChallenge,
        Method::None if path.enroll_target => Decision::Allow,
        Method::None => Decision::RedirectEnroll,
    }
}

/// Resolve the gate inputs for one request and decide.
///
/// Takes the path and headers rather than the request itself: borrowing
/// the request body across an await would make the future non-`Send`.
async fn evaluate(
    state: &AppState,
    path: &str,
    headers: &HeaderMap,
) -> Result<Decision> {
    let path = PathClass::of(path);
    let identity = Identity::from_headers(headers);

    let (method, assurance, proof_ok) = match &identity {
        None => (Method::None, Assurance::Password, false),
        Some(identity) => {
            let method =
                state.orchestrator.registry.get_method(&identity.id).await?;
            let assurance = match method {
                Method::Totp => state.provider.assurance(&identity.id)?,
                _ => Assurance::Password,
            };
            let proof_ok = method == Method::Email
                && headers
                    .get(header::COOKIE)
                    .and_then(|value| value.to_str().ok())
                    .and_then(|cookies| {
                        state.signer.from_cookie_header(cookies)
                    })
                    .is_some_and(|token| {
                        state.signer.verify(token, &identity.id)
                    });
            (method, assurance, proof_ok)
        },
    };

    Ok(decide(identity.as_ref(), method, assurance, proof_ok, path))
}

fn redirect(location: &str) -> Response {
    Response::builder()
        .status(StatusCode::SEE_OTHER)
        .header(header::LOCATION, location)
        .body(axum::body::Body::empty())
        .unwrap_or_else(|_| StatusCode::SEE_OTHER.into_response())
}

/// Gate middleware applied to every protected route.
///
/// Browser navigations get 303 redirects into the enrollment or
/// challenge flow; API paths get structured 401/403 JSON instead of
/// HTML redirects.
pub async fn enforce(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response> {
    let path = req.uri().path().to_owned();
    let headers = req.headers().clone();
    let api = PathClass::of(&path).api;

    match evaluate(&state, &path, &headers).await? {
        Decision::Allow => Ok(next.run(req).await),
        Decision::Deny(status) => {
            Err(match status {
                StatusCode::UNAUTHORIZED => ServerError::Unauthenticated,
                _ => ServerError::ChallengeRequired,
            })
        },
        Decision::RedirectLogin => Ok(redirect(LOGIN_ROUTE)),
        Decision::RedirectEnroll if api => {
            Err(ServerError::EnrollmentRequired)
        },
        Decision::RedirectEnroll => Ok(redirect(ENROLL_ROUTE)),
        Decision::RedirectChallenge if api => {
            Err(ServerError::ChallengeRequired)
        },
        Decision::RedirectChallenge => Ok(redirect(CHALLENGE_ROUTE)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> Identity {
        Identity {
            id: "u1".into(),
            email: "u1@example.org".into(),
        }
    }

    fn page(path: &str) -> PathClass {
        PathClass::of(path)
    }

    #[test]
    fn test_no_identity() {
        assert_eq!(
            decide(None, Method::None, Assurance::Password, false, page("/")),
            Decision::RedirectLogin
        );
        assert_eq!(
            decide(
                None,
                Method::None,
                Assurance::Password,
                false,
                page("/api/v1/things")
            ),
            Decision::Deny(StatusCode::UNAUTHORIZED)
        );
        for path in ["/login", "/signup", "/auth/public/jwks"] {
            assert_eq!(
                decide(
                    None,
                    Method::None,
                    Assurance::Password,
                    false,
                    page(path)
                ),
                Decision::Allow
            );
        }
    }

    #[test]
    fn test_totp_rows() {
        let user = identity();

        assert_eq!(
            decide(
                Some(&user),
                Method::Totp,
                Assurance::Elevated,
                false,
                page("/")
            ),
            Decision::Allow
        );
        assert_eq!(
            decide(
                Some(&user),
                Method::Totp,
                Assurance::Password,
                false,
                page(CHALLENGE_ROUTE)
            ),
            Decision::Allow
        );
        assert_eq!(
            decide(
                Some(&user),
                Method::Totp,
                Assurance::Password,
                false,
                page("/")
            ),
            Decision::RedirectChallenge
        );
    }

    #[test]
    fn test_email_rows() {
        let user = identity();

        assert_eq!(
            decide(
                Some(&user),
                Method::Email,
                Assurance::Password,
                true,
                page("/")
            ),
            Decision::Allow
        );
        assert_eq!(
            decide(
                Some(&user),
                Method::Email,
                Assurance::Password,
                false,
                page(CHALLENGE_ROUTE)
            ),
            Decision::Allow
        );
        assert_eq!(
            decide(
                Some(&user),
                Method::Email,
                Assurance::Password,
                false,
                page("/dashboard")
            ),
            Decision::RedirectChallenge
        );
    }

    #[test]
    fn test_none_rows() {
        let user = identity();

        assert_eq!(
            decide(
                Some(&user),
                Method::None,
                Assurance::Password,
                false,
                page(ENROLL_ROUTE)
            ),
            Decision::Allow
        );
        for path in ["/", "/dashboard", "/api/v1/things"] {
            assert_eq!(
                decide(
                    Some(&user),
                    Method::None,
                    Assurance::Password,
                    false,
                    page(path)
                ),
                Decision::RedirectEnroll
            );
        }
    }

    #[test]
    fn test_verification_endpoints_are_flow_targets() {
        for path in [
            "/auth/mfa/totp/verify",
            "/auth/mfa/email/start",
            "/auth/mfa/email/verify",
        ] {
            let class = page(path);
            assert!(class.enroll_target, "{path}");
            assert!(class.challenge_target, "{path}");
            assert!(!class.public, "{path}");
        }
    }

    #[test]
    fn test_factor_reset_routes_stay_challenged() {
        let user = identity();

        // An enrolled but unverified session must not reach the routes
        // that replace or remove the factor.
        for path in ["/auth/mfa/totp/start", "/auth/mfa/totp", "/auth/mfa/email"]
        {
            assert_eq!(
                decide(
                    Some(&user),
                    Method::Totp,
                    Assurance::Password,
                    false,
                    page(path)
                ),
                Decision::RedirectChallenge,
                "{path}"
            );
        }
        assert_eq!(
            decide(
                Some(&user),
                Method::Email,
                Assurance::Password,
                false,
                page("/auth/mfa/totp/start")
            ),
            Decision::RedirectChallenge
        );
    }

    fn require_send<F: std::future::Future + Send>(future: F) -> F {
        future
    }

    #[tokio::test]
    async fn test_evaluate_future_is_send() {
        let (state, _) = crate::test_state();
        let headers = HeaderMap::new();

        let decision =
            require_send(evaluate(&state, "/dashboard", &headers))
                .await
                .unwrap();
        assert_eq!(decision, Decision::RedirectLogin);
    }
}
