//! Get a new token pair with a refresh token.

use axum::Json;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;

use super::RefreshTokenBody;
use crate::session::TokenPair;
use crate::{AppState, ServerError};

pub async fn handler(
    State(state): State<AppState>,
    body: Result<Json<RefreshTokenBody>, JsonRejection>,
) -> Result<Json<TokenPair>, ServerError> {
    let Json(body) = body?;
    let pair = state.sessions.refresh(&body.refresh_token).await?;

    Ok(Json(pair))
}
