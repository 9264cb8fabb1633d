//! Authgate is a step-up (multi-factor) authorization gate: for every
//! request from an already-identified principal it decides whether the
//! request proceeds, enters an enrollment flow, enters a verification
//! challenge, or is rejected.

#[forbid(unsafe_code)]
#[deny(missing_docs, unused_mut)]
mod code;
pub mod config;
mod database;
pub mod error;
pub mod gate;
mod identity;
mod limiter;
mod mail;
mod mfa;
mod proof;
mod registry;
mod router;
pub mod telemetry;
mod totp;

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::http::{Method, StatusCode, header};
use axum::routing::get;
use axum::{Router, middleware as AxumMiddleware};
use tower::ServiceBuilder;
use tower_http::LatencyUnit;
use tower_http::cors::{Any, CorsLayer};
use tower_http::sensitive_headers::SetSensitiveHeadersLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::{
    DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer,
};

/// MUST NEVER be used in production.
#[cfg(test)]
pub async fn make_request(
    app: Router,
    method: Method,
    path: &str,
    principal: Option<&str>,
    cookie: Option<&str>,
    body: String,
) -> axum::http::Response<axum::body::Body> {
    use axum::extract::Request;
    use tower::util::ServiceExt;

    dbg!(&method, path, &body);

    let mut builder = Request::builder()
        .method(method)
        .uri(path)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(principal) = principal {
        builder = builder
            .header(identity::PRINCIPAL_HEADER, principal)
            .header(
                identity::EMAIL_HEADER,
                format!("{principal}@example.org"),
            );
    }
    if let Some(cookie) = cookie {
        builder = builder.header(header::COOKIE, cookie);
    }

    app.oneshot(builder.body(axum::body::Body::from(body)).unwrap())
        .await
        .unwrap()
}

/// In-memory state plus a handle on the mail deliveries it captures.
#[cfg(test)]
pub(crate) fn test_state()
-> (AppState, Arc<dashmap::DashMap<String, String>>) {
    let config = Arc::new(config::Configuration::default());
    let db = database::Database::memory();
    let signer =
        proof::ProofSigner::new("test-secret", "authgate_email_mfa", false);
    let provider = totp::LocalTotpProvider::new(Default::default(), "authgate");
    let (mail, deliveries) = mail::MailManager::sink();
    let limiter = limiter::RateLimiter::new();
    let orchestrator = mfa::Orchestrator::new(
        registry::FactorRegistry::new(db.clone()),
        code::CodeStore::new(db.clone()),
        provider.clone(),
        signer.clone(),
        mail,
        limiter.clone(),
        config.mfa.clone(),
    );

    (
        AppState {
            config,
            db,
            signer,
            provider,
            limiter,
            orchestrator,
        },
        deliveries,
    )
}

/// State sharing between routes.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<config::Configuration>,
    pub db: database::Database,
    pub signer: proof::ProofSigner,
    pub provider: totp::LocalTotpProvider,
    pub limiter: limiter::RateLimiter,
    pub orchestrator: mfa::Orchestrator,
}

/// Create router.
pub fn app(state: AppState) -> Router {
    let middleware = ServiceBuilder::new()
        // Add high level tracing/logging to all requests.
        .layer(
            TraceLayer::new_for_http()
                .on_body_chunk(|chunk: &Bytes, latency: Duration, _span: &tracing::Span| {
                    tracing::trace!(size_bytes = chunk.len(), latency = ?latency, "sending body chunk")
                })
                .make_span_with(DefaultMakeSpan::new().include_headers(true).level(tracing::Level::INFO))
                .on_request(DefaultOnRequest::new())
                .on_response(DefaultOnResponse::new().include_headers(true).latency_unit(LatencyUnit::Micros)),
        )
        // Set a timeout.
        .layer(TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, Duration::from_secs(10)))
        // Remove senstive headers from trace.
        .layer(SetSensitiveHeadersLayer::new([header::AUTHORIZATION, header::COOKIE]))
        // Add CORS preflight support.
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
                .allow_headers(Any)
                .vary([header::AUTHORIZATION]),
        );

    Router::new()
        // `GET /status.json` goes to `status`.
        .route("/status.json", get(router::status::status))
        .nest("/auth/mfa", router::mfa::router())
        .with_state(state.clone())
        // Every request, matched or not, crosses the gate.
        .layer(AxumMiddleware::from_fn_with_state(state, gate::enforce))
        .route_layer(AxumMiddleware::from_fn(telemetry::track))
        .layer(middleware)
}

/// Initialize the application state.
pub async fn initialize_state() -> Result<AppState, Box<dyn std::error::Error>>
{
    // read configuration file.  let it in memory.
    let config = config::Configuration::default().read()?;

    let db = match config.postgres {
        Some(ref pg) => {
            database::Database::new(
                &pg.address,
                &pg.username
                    .clone()
                    .unwrap_or(database::DEFAULT_CREDENTIALS.into()),
                &pg.password
                    .clone()
                    .unwrap_or(database::DEFAULT_CREDENTIALS.into()),
                &pg.database
                    .clone()
                    .unwrap_or(database::DEFAULT_DATABASE_NAME.into()),
                pg.pool_size.unwrap_or(database::DEFAULT_POOL_SIZE),
            )
            .await?
        },
        None => {
            tracing::warn!(
                "missing `postgres` entry on `config.yaml` file, \
                 factors and codes are kept in process memory"
            );
            database::Database::memory()
        },
    };

    // execute migrations scripts on start.
    if let database::Database::Postgres(pool) = &db {
        sqlx::migrate!().run(pool).await?;
    }

    // missing secret is fatal here when `production` is set.
    let secret = config.signing_secret()?;
    let signer = proof::ProofSigner::new(
        &secret,
        &config.mfa.cookie_name,
        config.production,
    );

    let provider = totp::LocalTotpProvider::new(
        config.totp.clone().unwrap_or_default(),
        &config.name,
    );

    // handle mail sender.
    let mail = if let Some(cfg) = &config.mail {
        mail::MailManager::new(cfg).await?
    } else {
        mail::MailManager::default()
    };

    let limiter = limiter::RateLimiter::new();
    limiter.spawn_sweeper(Duration::from_secs(60));

    let orchestrator = mfa::Orchestrator::new(
        registry::FactorRegistry::new(db.clone()),
        code::CodeStore::new(db.clone()),
        provider.clone(),
        signer.clone(),
        mail,
        limiter.clone(),
        config.mfa.clone(),
    );

    Ok(AppState {
        config,
        db,
        signer,
        provider,
        limiter,
        orchestrator,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Method;
    use http_body_util::BodyExt;
    use serde_json::json;

    fn state() -> (AppState, Arc<dashmap::DashMap<String, String>>) {
        test_state()
    }

    fn proof_cookie_pair(set_cookie: &str) -> String {
        // `Set-Cookie: name=value; attributes...` -> `name=value`.
        set_cookie.split(';').next().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_fresh_principal_walks_email_enrollment() {
        let (state, deliveries) = state();

        // NoFactor principal anywhere but the enrollment flow: redirect.
        let response = make_request(
            app(state.clone()),
            Method::GET,
            "/",
            Some("u1"),
            None,
            String::default(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(
            response.headers()[header::LOCATION],
            gate::ENROLL_ROUTE
        );

        // Request a code.
        let response = make_request(
            app(state.clone()),
            Method::POST,
            "/auth/mfa/email/start",
            Some("u1"),
            None,
            String::default(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let code = deliveries.get("u1@example.org").unwrap().clone();

        // Verify it: enrollment commits and the proof cookie is set.
        let response = make_request(
            app(state.clone()),
            Method::POST,
            "/auth/mfa/email/verify",
            Some("u1"),
            None,
            json!({ "code": code }).to_string(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let set_cookie =
            response.headers()[header::SET_COOKIE].to_str().unwrap().to_string();
        let cookie = proof_cookie_pair(&set_cookie);

        // Gate now allows the request through (404: no such route behind
        // the gate, but the decision was Allow).
        let response = make_request(
            app(state.clone()),
            Method::GET,
            "/",
            Some("u1"),
            Some(&cookie),
            String::default(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        // Replaying the consumed code fails with the generic error.
        let response = make_request(
            app(state.clone()),
            Method::POST,
            "/auth/mfa/email/verify",
            Some("u1"),
            Some(&cookie),
            json!({ "code": code }).to_string(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_enrolled_principal_without_proof_is_challenged() {
        let (state, deliveries) = state();

        let user = identity::Identity {
            id: "u2".into(),
            email: "u2@example.org".into(),
        };
        state.orchestrator.start_email(&user).await.unwrap();
        let code = deliveries.get("u2@example.org").unwrap().clone();
        state.orchestrator.verify_email(&user, &code).await.unwrap();

        // No cookie on the next navigation: challenge redirect.
        let response = make_request(
            app(state.clone()),
            Method::GET,
            "/dashboard",
            Some("u2"),
            None,
            String::default(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(
            response.headers()[header::LOCATION],
            gate::CHALLENGE_ROUTE
        );

        // Same situation on an API path: structured 403, no redirect.
        let response = make_request(
            app(state.clone()),
            Method::GET,
            "/api/v1/things",
            Some("u2"),
            None,
            String::default(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        // Tampered cookie is an invalid proof, not an allow.
        let token = state.signer.sign("u2").unwrap();
        let mut tampered = token.clone();
        tampered.pop();
        tampered.push(if token.ends_with('0') { '1' } else { '0' });
        let response = make_request(
            app(state.clone()),
            Method::GET,
            "/dashboard",
            Some("u2"),
            Some(&format!("authgate_email_mfa={tampered}")),
            String::default(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
    }

    #[tokio::test]
    async fn test_unauthenticated_requests() {
        let (state, _) = state();

        // Browser navigation goes back to login.
        let response = make_request(
            app(state.clone()),
            Method::GET,
            "/dashboard",
            None,
            None,
            String::default(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(response.headers()[header::LOCATION], "/login");

        // API path: structured 401.
        let response = make_request(
            app(state.clone()),
            Method::GET,
            "/api/v1/things",
            None,
            None,
            String::default(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        // Liveness stays reachable.
        let response = make_request(
            app(state.clone()),
            Method::GET,
            "/status.json",
            None,
            None,
            String::default(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert!(serde_json::from_slice::<serde_json::Value>(&body).is_ok());
    }

    #[tokio::test]
    async fn test_rate_limited_send_carries_retry_after() {
        let (state, _) = state();

        for _ in 0..3 {
            let response = make_request(
                app(state.clone()),
                Method::POST,
                "/auth/mfa/email/start",
                Some("u3"),
                None,
                String::default(),
            )
            .await;
            assert_eq!(response.status(), StatusCode::ACCEPTED);
        }

        let response = make_request(
            app(state.clone()),
            Method::POST,
            "/auth/mfa/email/start",
            Some("u3"),
            None,
            String::default(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let retry_after = response.headers()[header::RETRY_AFTER]
            .to_str()
            .unwrap()
            .to_string();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(
            body["error"],
            format!("Rate limit exceeded. Try again in {retry_after}s.")
        );
    }

    #[tokio::test]
    async fn test_bad_code_shape_is_rejected_by_validation() {
        let (state, _) = state();

        let response = make_request(
            app(state),
            Method::POST,
            "/auth/mfa/email/verify",
            Some("u4"),
            None,
            json!({ "code": "12345" }).to_string(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
