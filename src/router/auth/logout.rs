//! Close a session.

use axum::Json;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;

use super::RefreshTokenBody;
use crate::{AppState, ServerError};

pub async fn handler(
    State(state): State<AppState>,
    body: Result<Json<RefreshTokenBody>, JsonRejection>,
) -> Result<StatusCode, ServerError> {
    let Json(body) = body?;
    state.sessions.logout(&body.refresh_token).await?;

    Ok(StatusCode::NO_CONTENT)
}
