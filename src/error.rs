//! Error handler for the HTTP surface.

use axum::extract::rejection::JsonRejection;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

use crate::keys::KeyError;
use crate::refresh::StoreError;
use crate::session::SessionError;
use crate::token::{IssueError, Rejection};

pub type Result<T> = std::result::Result<T, ServerError>;

/// Enum representing server-side errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Axum(#[from] JsonRejection),

    #[error("invalid bearer token: {0}")]
    Unauthorized(Rejection),

    #[error("missing scopes: {}", .0.join(", "))]
    Forbidden(Vec<String>),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error("internal server error, {details}")]
    Internal {
        details: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl From<Rejection> for ServerError {
    fn from(rejection: Rejection) -> Self {
        match rejection {
            Rejection::Store(err) => ServerError::Store(err),
            rejection => ServerError::Unauthorized(rejection),
        }
    }
}

impl From<IssueError> for ServerError {
    fn from(err: IssueError) -> Self {
        match err {
            IssueError::Store(err) => ServerError::Store(err),
            IssueError::Key(err) => ServerError::Key(err),
            IssueError::Superseded(_) => {
                ServerError::Unauthorized(Rejection::Revoked)
            },
            err => ServerError::Internal {
                details: err.to_string(),
                source: Some(Box::new(err)),
            },
        }
    }
}

impl From<SessionError> for ServerError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Rejected(rejection) => rejection.into(),
            SessionError::Issue(err) => err.into(),
        }
    }
}

/// Structure for detailed error responses.
#[derive(Debug, Serialize)]
pub struct ResponseError {
    r#type: Option<String>,
    title: String,
    status: u16,
    detail: String,
    instance: Option<String>,
    errors: Option<Vec<String>>,
}

impl ResponseError {
    /// Update error status code.
    pub fn status(mut self, code: StatusCode) -> Self {
        self.status = code.as_u16();
        self
    }

    /// Update `title` field.
    pub fn title(mut self, title: &str) -> Self {
        self.title = title.into();
        self
    }

    /// Add detailed error.
    pub fn details(mut self, description: &str) -> Self {
        self.detail = description.into();
        self
    }

    /// List the individual causes.
    pub fn errors(mut self, errors: Vec<String>) -> Self {
        self.errors = Some(errors);
        self
    }

    /// Transform [`ResponseError`] into axum [`Response`].
    pub fn into_response(
        self,
    ) -> std::result::Result<Response, axum::http::Error> {
        if let Ok(body) = serde_json::to_string(&self) {
            let mut response = Response::builder()
                .status(self.status)
                .header(header::CONTENT_TYPE, "application/problem+json");
            if self.status == StatusCode::UNAUTHORIZED.as_u16() {
                response = response.header(header::WWW_AUTHENTICATE, "Bearer");
            }
            response.body(body.into())
        } else {
            Ok(internal_server_error())
        }
    }
}

impl Default for ResponseError {
    fn default() -> Self {
        Self {
            r#type: None,
            title: "Internal server error.".to_owned(),
            status: StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
            detail: String::default(),
            instance: None,
            errors: None,
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let response = ResponseError::default()
            .title("There were validation errors with your request.")
            .details(&self.to_string())
            .status(StatusCode::BAD_REQUEST);

        let response = match self {
            ServerError::Axum(_) => response,

            ServerError::Unauthorized(rejection) => response
                .title("Missing or invalid 'Authorization' header.")
                .details(&rejection.to_string())
                .errors(vec![rejection.as_str().to_owned()])
                .status(StatusCode::UNAUTHORIZED),

            ServerError::Forbidden(missing) => response
                .title("Insufficient scopes.")
                .errors(missing)
                .status(StatusCode::FORBIDDEN),

            ServerError::Store(err) => {
                tracing::error!(%err, "refresh token store unavailable");

                ResponseError::default()
                    .title("Service temporarily unavailable.")
                    .status(StatusCode::SERVICE_UNAVAILABLE)
            },

            ServerError::Key(err) => {
                tracing::error!(%err, "server returned 500 status");

                ResponseError::default()
            },

            ServerError::Internal { details, source } => {
                tracing::error!(err = ?source, %details, "server returned 500 status");

                ResponseError::default()
            },
        };

        response
            .into_response()
            .unwrap_or_else(|_| internal_server_error())
    }
}

fn internal_server_error() -> Response {
    Response::builder()
        .status(StatusCode::INTERNAL_SERVER_ERROR)
        .header(header::CONTENT_TYPE, "application/problem+json")
        .body(
            serde_json::json!({
                "type": null,
                "title": "Internal server error.",
                "status": StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
                "detail": null,
                "instance": null,
                "errors": null,
            })
            .to_string()
            .into(),
        )
        .unwrap_or_else(|_| Response::new("Internal server error".into()))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::token::Malformed;

    #[test]
    fn test_rejection_status() {
        let response =
            ServerError::from(Rejection::Expired).into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.headers().get(header::WWW_AUTHENTICATE).unwrap(),
            "Bearer"
        );

        let response = ServerError::from(Rejection::Malformed(Malformed(
            "missing bearer token",
        )))
        .into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_store_failure_is_not_unauthorized() {
        let err = ServerError::from(Rejection::Store(StoreError::Timeout(
            Duration::from_secs(2),
        )));
        let response = err.into_response();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(response.headers().get(header::WWW_AUTHENTICATE).is_none());
    }

    #[test]
    fn test_forbidden() {
        let response =
            ServerError::Forbidden(vec!["write".into()]).into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn test_key_error() {
        let response = ServerError::from(IssueError::Key(KeyError::Signing))
            .into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
