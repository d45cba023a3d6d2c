//! Public server status.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use serde::{Deserialize, Serialize};

use crate::config::Configuration;

/// Structured status.
#[derive(Debug, Serialize, Deserialize)]
pub struct Status {
    pub name: String,
    pub version: String,
    pub issuer: String,
}

/// Public server status (configuration).
pub async fn status(State(config): State<Arc<Configuration>>) -> Json<Status> {
    Json(Status {
        name: config.name.clone(),
        version: config.version().to_owned(),
        issuer: config.token.issuer.clone(),
    })
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use http_body_util::BodyExt;

    use super::*;
    use crate::*;

    #[tokio::test]
    async fn test_status_handler() {
        let state = test_state();
        let app = app(state);

        let response =
            make_request(None, app, Method::GET, "/status.json", String::default())
                .await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let body: Status = serde_json::from_slice(&body).unwrap();
        assert_eq!(body.name, "travel-board");
        assert_eq!(body.version, env!("CARGO_PKG_VERSION"));
        assert_eq!(body.issuer, "travel-board");
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let response = make_request(
            None,
            app(test_state()),
            Method::GET,
            "/does-not-exist",
            String::default(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
