//! Token authentication core for the travel-board API services.
//!
//! Issues, signs, verifies and refreshes bearer tokens, and checks scopes on
//! every request.

#![forbid(unsafe_code)]

pub mod authorization;
pub mod clock;
pub mod config;
pub mod error;
pub mod keys;
pub mod middleware;
pub mod refresh;
mod router;
pub mod session;
pub mod telemetry;
pub mod token;
mod well_known;

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::FromRef;
use axum::http::{Method, StatusCode, header};
use axum::routing::get;
use axum::{Router, middleware as AxumMiddleware};
use error::ServerError;
use tower::ServiceBuilder;
use tower_http::LatencyUnit;
use tower_http::cors::{Any, CorsLayer};
use tower_http::sensitive_headers::SetSensitiveHeadersLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::{
    DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer,
};

use clock::{Clock, SystemClock};
use keys::KeyMaterialProvider;
use refresh::{MemoryRefreshStore, PgRefreshStore, RefreshTokenStore};
use session::SessionService;

/// MUST NEVER be used in production.
#[cfg(test)]
pub async fn make_request(
    token: Option<&str>,
    app: Router,
    method: Method,
    path: &str,
    body: String,
) -> axum::http::Response<axum::body::Body> {
    use axum::extract::Request;
    use tower::util::ServiceExt;

    let mut request = Request::builder()
        .method(method)
        .uri(path)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = token {
        request = request.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }

    app.oneshot(request.body(axum::body::Body::from(body)).unwrap())
        .await
        .unwrap()
}

/// State backed by an in-memory store and a single HMAC key, `k1`.
#[cfg(test)]
pub fn test_state() -> AppState {
    let config = Arc::new(config::Configuration::default());
    let keys = Arc::new(KeyMaterialProvider::new(
        keys::tests::hmac_key("k1", 1),
        Duration::from_secs(60),
    ));
    AppState::new(
        config,
        keys,
        Arc::new(MemoryRefreshStore::new()),
        Arc::new(SystemClock::new()),
    )
}

/// Open a session for `u1`.
#[cfg(test)]
pub async fn test_login(state: &AppState, scopes: &[&str]) -> session::TokenPair {
    let identity = token::Identity::new("u1").unwrap();
    state
        .sessions
        .login(&identity, scopes.iter().copied())
        .await
        .unwrap()
}

/// State sharing between routes.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<config::Configuration>,
    pub keys: Arc<KeyMaterialProvider>,
    pub sessions: Arc<SessionService>,
}

impl AppState {
    pub fn new(
        config: Arc<config::Configuration>,
        keys: Arc<KeyMaterialProvider>,
        store: Arc<dyn RefreshTokenStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let sessions = SessionService::new(
            Arc::clone(&keys),
            store,
            config.token.policy(),
            clock,
        );
        Self {
            config,
            keys,
            sessions: Arc::new(sessions),
        }
    }
}

impl FromRef<AppState> for Arc<KeyMaterialProvider> {
    fn from_ref(state: &AppState) -> Arc<KeyMaterialProvider> {
        Arc::clone(&state.keys)
    }
}

/// Create router.
pub fn app(state: AppState) -> Router {
    let middleware = ServiceBuilder::new()
        // Mark sensitive headers before the trace span records them.
        .layer(SetSensitiveHeadersLayer::new([header::AUTHORIZATION, header::COOKIE]))
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
        // Add CORS preflight support.
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::OPTIONS])
                .allow_headers(Any)
                .vary([header::AUTHORIZATION]),
        );

    Router::new()
        // `GET /status.json` goes to `status`.
        .route("/status.json", get(router::status::status))
        .nest("/auth", router::auth::router())
        .nest("/.well-known", well_known::well_known())
        .route_layer(AxumMiddleware::from_fn(telemetry::track))
        // Every route but `middleware::EXCLUDED_PATHS` needs a bearer token.
        // Unmatched paths fall through to a plain 404.
        .route_layer(AxumMiddleware::from_fn_with_state(
            state.clone(),
            middleware::authenticate,
        ))
        .with_state(state)
        .layer(middleware)
}

/// Initialize the application state.
pub async fn initialize_state() -> Result<AppState, Box<dyn std::error::Error>>
{
    // read configuration file. let it in memory.
    let path = std::env::var_os(config::CONFIG_ENV).unwrap_or_default();
    let config = config::Configuration::default().path(path.into()).read();

    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());

    // no active signing key is fatal.
    let keys = Arc::new(config.token.key_material(clock.now())?);
    tracing::info!(
        kid = %keys.current_signing_key().kid(),
        algorithm = %keys.current_signing_key().algorithm(),
        "signing key loaded"
    );

    let store: Arc<dyn RefreshTokenStore> = match &config.postgres {
        Some(postgres) => Arc::new(
            PgRefreshStore::connect(&postgres.url, postgres.pool_size).await?,
        ),
        None => {
            tracing::warn!(
                "missing `postgres` entry on `config.yaml` file, refresh tokens are kept in memory"
            );
            Arc::new(MemoryRefreshStore::new())
        },
    };

    Ok(AppState::new(config, keys, store, clock))
}
