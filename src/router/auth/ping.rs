//! Authenticated echo of the token subject.

use std::collections::BTreeSet;

use axum::{Extension, Json};
use serde::{Deserialize, Serialize};

use crate::token::Claims;

#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub sub: String,
    pub scopes: BTreeSet<String>,
}

pub async fn handler(Extension(claims): Extension<Claims>) -> Json<Response> {
    Json(Response {
        sub: claims.sub,
        scopes: claims.scopes,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use axum::http::StatusCode;
    use http_body_util::BodyExt;

    use super::*;
    use crate::*;

    #[tokio::test]
    async fn test_ping() {
        let state = test_state();
        let pair = test_login(&state, &["read"]).await;

        let response = make_request(
            Some(&pair.access_token),
            app(state),
            Method::GET,
            "/auth/ping",
            String::default(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let body: Response = serde_json::from_slice(&body).unwrap();
        assert_eq!(body.sub, "u1");
    }

    #[tokio::test]
    async fn test_missing_header() {
        let response = make_request(
            None,
            app(test_state()),
            Method::GET,
            "/auth/ping",
            String::default(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.headers().get(header::WWW_AUTHENTICATE).unwrap(),
            "Bearer"
        );
    }

    #[tokio::test]
    async fn test_insufficient_scope() {
        let state = test_state();
        let pair = test_login(&state, &["write"]).await;

        let response = make_request(
            Some(&pair.access_token),
            app(state),
            Method::GET,
            "/auth/ping",
            String::default(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_tampered_token() {
        let state = test_state();
        let pair = test_login(&state, &["read"]).await;
        // Same structure, different first signature character.
        let (head, signature) = pair.access_token.rsplit_once('.').unwrap();
        let first = if signature.starts_with('A') { 'B' } else { 'A' };
        let token = format!("{head}.{first}{}", &signature[1..]);

        let response = make_request(
            Some(&token),
            app(state),
            Method::GET,
            "/auth/ping",
            String::default(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["errors"][0], "bad_signature");
    }

    #[derive(Clone, Default)]
    struct LogBuffer(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_token_stays_out_of_logs() {
        let state = test_state();
        let pair = test_login(&state, &["read"]).await;

        let logs = LogBuffer::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let response = make_request(
            Some(&pair.access_token),
            app(state),
            Method::GET,
            "/auth/ping",
            String::default(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        let logs = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
        assert!(logs.contains("/auth/ping"));
        assert!(logs.contains("authorization"));
        assert!(!logs.contains(&pair.access_token));
    }
}
