//! Middlewares for routes.

use axum::extract::{OriginalUri, Request, State};
use axum::http::header;
use axum::middleware::Next;
use axum::response::Response;

use crate::authorization::{self, Decision};
use crate::error::{Result, ServerError};
use crate::token::{Claims, Malformed, Rejection};
use crate::AppState;

/// Paths reachable without an access token.
pub const EXCLUDED_PATHS: &[&str] = &[
    "/auth/access-token",
    "/auth/logout",
    "/status.json",
    "/.well-known/jwks.json",
];

/// Scopes a route requires, see [`require_scopes`].
#[derive(Debug, Clone, Copy)]
pub struct RequiredScopes(pub &'static [&'static str]);

/// Verify the bearer token and expose its [`Claims`] to the next handlers.
pub async fn authenticate(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response> {
    let path = req
        .extensions()
        .get::<OriginalUri>()
        .map_or_else(|| req.uri().path(), |uri| uri.0.path());
    if EXCLUDED_PATHS.contains(&path) {
        return Ok(next.run(req).await);
    }

    let header = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|header| header.to_str().ok());
    let claims = state.sessions.authenticate(header)?;

    req.extensions_mut().insert::<Claims>(claims);
    Ok(next.run(req).await)
}

/// Route guard refusing tokens without every required scope.
pub async fn require_scopes(
    State(RequiredScopes(required)): State<RequiredScopes>,
    req: Request,
    next: Next,
) -> Result<Response> {
    let Some(claims) = req.extensions().get::<Claims>() else {
        return Err(Rejection::Malformed(Malformed("missing bearer token")).into());
    };

    match authorization::authorize(claims, required) {
        Decision::Granted => Ok(next.run(req).await),
        Decision::Denied(missing) => {
            tracing::debug!(sub = %claims.sub, ?missing, "insufficient scopes");
            Err(ServerError::Forbidden(missing))
        },
    }
}
