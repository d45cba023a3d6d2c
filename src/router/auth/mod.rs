//! Token lifecycle routes.

pub mod access_token;
pub mod logout;
pub mod ping;

use axum::routing::{get, patch, post};
use axum::{Router, middleware};
use serde::Deserialize;

use crate::AppState;
use crate::middleware::{RequiredScopes, require_scopes};

/// Body carrying a refresh token.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RefreshTokenBody {
    pub refresh_token: String,
}

pub fn router() -> Router<AppState> {
    Router::new()
        // `PATCH /auth/access-token` exchanges a refresh token.
        .route("/access-token", patch(access_token::handler))
        // `POST /auth/logout` revokes the refresh token family.
        .route("/logout", post(logout::handler))
        // `GET /auth/ping`. `read` scope required.
        .route(
            "/ping",
            get(ping::handler).route_layer(middleware::from_fn_with_state(
                RequiredScopes(&["read"]),
                require_scopes,
            )),
        )
}
