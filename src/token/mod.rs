//! Manage signed bearer tokens.

pub mod codec;
pub mod issuer;
pub mod verifier;

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::keys::Algorithm;

pub use codec::Malformed;
pub use issuer::{IssueError, TokenIssuer};
pub use verifier::{Rejection, TokenVerifier};

/// Value written in the `typ` header.
pub const HEADER_TYPE: &str = "JWT";
pub const DEFAULT_ISSUER: &str = "travel-board";
pub const DEFAULT_AUDIENCE: &str = "travel-board";
pub const ACCESS_TOKEN_EXPIRATION: u64 = 900; // 15 minutes.
pub const REFRESH_TOKEN_EXPIRATION: u64 = 7 * 24 * 3600; // 7 days.
pub const STORE_TIMEOUT: Duration = Duration::from_secs(2);

/// Values shared by the issuer and the verifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenPolicy {
    pub issuer: String,
    pub audience: String,
    /// Access token lifetime, in seconds.
    pub access_ttl: u64,
    /// Refresh token lifetime, in seconds.
    pub refresh_ttl: u64,
    /// Upper bound for every refresh store call.
    pub store_timeout: Duration,
}

impl Default for TokenPolicy {
    fn default() -> Self {
        Self {
            issuer: DEFAULT_ISSUER.to_owned(),
            audience: DEFAULT_AUDIENCE.to_owned(),
            access_ttl: ACCESS_TOKEN_EXPIRATION,
            refresh_ttl: REFRESH_TOKEN_EXPIRATION,
            store_timeout: STORE_TIMEOUT,
        }
    }
}

/// Opaque identifier of an authenticated subject.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity(String);

impl Identity {
    /// Create a new [`Identity`].
    ///
    /// Returns [`None`] when `subject` is empty.
    pub fn new(subject: impl Into<String>) -> Option<Self> {
        let subject = subject.into();
        if subject.is_empty() {
            None
        } else {
            Some(Self(subject))
        }
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Whether a token grants access or renews it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Access,
    Refresh,
}

impl TokenKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenKind::Access => "access",
            TokenKind::Refresh => "refresh",
        }
    }
}

/// First segment of a token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Header {
    /// Algorithm used for the signature.
    pub alg: Algorithm,
    /// Id of the key that produced the signature.
    pub kid: String,
    pub typ: String,
}

impl Header {
    pub fn new(alg: Algorithm, kid: impl Into<String>) -> Self {
        Self {
            alg,
            kid: kid.into(),
            typ: HEADER_TYPE.to_owned(),
        }
    }
}

/// Pieces of information asserted on a token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Claims {
    /// Subject (user ID).
    pub sub: String,
    /// Issued at (Unix timestamp, seconds).
    pub iat: u64,
    /// Expiration time (Unix timestamp, seconds). The token must not be
    /// accepted on or after it.
    pub exp: u64,
    /// Issuer.
    pub iss: String,
    /// Audience.
    pub aud: String,
    /// Granted scopes.
    pub scopes: BTreeSet<String>,
    /// Refresh token family.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fam: Option<String>,
    pub typ: TokenKind,
    /// Unique token id.
    pub jti: String,
}

/// A token as it leaves the issuer.
#[derive(Debug, Clone)]
pub struct SignedToken {
    pub header: Header,
    pub claims: Claims,
    encoded: String,
}

impl SignedToken {
    /// Wire representation, ready for an `Authorization: Bearer` header.
    pub fn as_str(&self) -> &str {
        &self.encoded
    }

    pub fn into_string(self) -> String {
        self.encoded
    }
}

impl fmt::Display for SignedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encoded)
    }
}
