//! Based on JWK (RFC 7517 <https://datatracker.ietf.org/doc/html/rfc7517>).
//!
//! HMAC keys are symmetric and never published.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use serde::Serialize;

use crate::keys::{KeyMaterialProvider, PublicJwk};

#[derive(Debug, Serialize)]
pub struct Response {
    keys: Vec<PublicJwk>,
}

pub async fn handler(
    State(keys): State<Arc<KeyMaterialProvider>>,
) -> Json<Response> {
    let keys = keys
        .snapshot()
        .iter()
        .filter_map(|key| key.public_jwk())
        .collect();

    Json(Response { keys })
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use http_body_util::BodyExt;

    use crate::keys::Key;
    use crate::keys::tests::{EC_PKCS8, RSA_PKCS8};
    use crate::*;

    async fn jwks(state: AppState) -> serde_json::Value {
        let response = make_request(
            None,
            app(state),
            Method::GET,
            "/.well-known/jwks.json",
            String::default(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_hmac_keys_are_private() {
        let body = jwks(test_state()).await;
        assert_eq!(body["keys"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_jwks_handler() {
        let state = test_state();
        state
            .keys
            .rotate(Key::ecdsa_pem(Some("ec".into()), EC_PKCS8).unwrap(), 0)
            .unwrap();
        state
            .keys
            .rotate(Key::rsa_pem(Some("rsa".into()), RSA_PKCS8).unwrap(), 0)
            .unwrap();

        let body = jwks(state).await;
        let keys = body["keys"].as_array().unwrap();
        assert_eq!(keys.len(), 2);

        assert_eq!(keys[0]["kid"], "rsa");
        assert_eq!(keys[0]["kty"], "RSA");
        assert_eq!(keys[0]["alg"], "RS256");
        assert_eq!(keys[0]["e"], "AQAB");

        assert_eq!(keys[1]["kid"], "ec");
        assert_eq!(keys[1]["kty"], "EC");
        assert_eq!(keys[1]["crv"], "P-256");
        assert_eq!(keys[1]["x"].as_str().unwrap().len(), 43);
    }
}
