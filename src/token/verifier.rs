//! Check wire tokens and rebuild their claims.
//!
//! Checks run in a fixed order and stop at the first failure: structure, key
//! lookup, signature, expiry, issuer, audience, token kind and, for refresh
//! tokens, the family state in the refresh store.

use std::sync::Arc;

use super::codec::{self, Malformed};
use super::{Claims, TokenKind, TokenPolicy};
use crate::keys::KeyMaterialProvider;
use crate::refresh::{
    self, FamilyState, RefreshRecord, RefreshTokenStore, StoreError,
};

/// Reason a token was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    #[error(transparent)]
    Malformed(#[from] Malformed),
    #[error("unknown signing key `{0}`")]
    UnknownKey(String),
    #[error("signature does not match")]
    BadSignature,
    #[error("token expired")]
    Expired,
    #[error("token issued by an unexpected issuer")]
    WrongIssuer,
    #[error("token intended for another audience")]
    WrongAudience,
    #[error("{} token expected", expected.as_str())]
    WrongTokenType { expected: TokenKind },
    #[error("refresh token revoked")]
    Revoked,
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl Rejection {
    /// Stable label for logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Rejection::Malformed(_) => "malformed",
            Rejection::UnknownKey(_) => "unknown_key",
            Rejection::BadSignature => "bad_signature",
            Rejection::Expired => "expired",
            Rejection::WrongIssuer => "wrong_issuer",
            Rejection::WrongAudience => "wrong_audience",
            Rejection::WrongTokenType { .. } => "wrong_token_type",
            Rejection::Revoked => "revoked",
            Rejection::Store(_) => "store_error",
        }
    }
}

fn observe<T>(kind: TokenKind, result: Result<T, Rejection>) -> Result<T, Rejection> {
    let outcome = match &result {
        Ok(_) => "valid",
        Err(rejection) => rejection.as_str(),
    };
    metrics::counter!(
        "token_verifications_total",
        "kind" => kind.as_str(),
        "outcome" => outcome
    )
    .increment(1);

    match &result {
        Err(Rejection::BadSignature) => {
            tracing::warn!(kind = kind.as_str(), "token signature mismatch, possible tampering")
        },
        Err(Rejection::Store(err)) => {
            tracing::error!(%err, "refresh token store unavailable")
        },
        Err(rejection) => {
            tracing::debug!(kind = kind.as_str(), reason = outcome, %rejection, "token rejected")
        },
        Ok(_) => (),
    }

    result
}

/// Token verifier.
pub struct TokenVerifier {
    keys: Arc<KeyMaterialProvider>,
    store: Arc<dyn RefreshTokenStore>,
    policy: TokenPolicy,
}

impl TokenVerifier {
    /// Create a new [`TokenVerifier`].
    pub fn new(
        keys: Arc<KeyMaterialProvider>,
        store: Arc<dyn RefreshTokenStore>,
        policy: TokenPolicy,
    ) -> Self {
        Self {
            keys,
            store,
            policy,
        }
    }

    /// Verify an access token at `now`.
    pub fn verify_access(&self, token: &str, now: u64) -> Result<Claims, Rejection> {
        observe(TokenKind::Access, self.check(token, TokenKind::Access, now))
    }

    /// Verify a refresh token at `now`, including its family state.
    ///
    /// Presenting a refresh token that was already exchanged revokes its
    /// whole family.
    pub async fn verify_refresh(
        &self,
        token: &str,
        now: u64,
    ) -> Result<(Claims, RefreshRecord), Rejection> {
        let result = match self.check(token, TokenKind::Refresh, now) {
            Ok(claims) => self.check_family(claims).await,
            Err(rejection) => Err(rejection),
        };
        observe(TokenKind::Refresh, result)
    }

    fn check(
        &self,
        token: &str,
        expected: TokenKind,
        now: u64,
    ) -> Result<Claims, Rejection> {
        let decoded = codec::decode(token)?;

        let key = self
            .keys
            .verification_key_at(&decoded.header.kid, now)
            .map_err(|_| Rejection::UnknownKey(decoded.header.kid.clone()))?;

        if decoded.header.alg != key.algorithm()
            || !key.verify(decoded.signing_input.as_bytes(), &decoded.signature)
        {
            return Err(Rejection::BadSignature);
        }

        let claims = decoded.claims;
        if now >= claims.exp {
            return Err(Rejection::Expired);
        }
        if claims.iss != self.policy.issuer {
            return Err(Rejection::WrongIssuer);
        }
        if claims.aud != self.policy.audience {
            return Err(Rejection::WrongAudience);
        }
        if claims.typ != expected {
            return Err(Rejection::WrongTokenType { expected });
        }

        Ok(claims)
    }

    async fn check_family(
        &self,
        claims: Claims,
    ) -> Result<(Claims, RefreshRecord), Rejection> {
        let Some(family) = claims.fam.as_deref() else {
            return Err(Malformed("refresh token without family").into());
        };

        let state = refresh::with_timeout(
            self.policy.store_timeout,
            self.store.get(family),
        )
        .await?;

        let record = match state {
            FamilyState::Active(record) => record,
            FamilyState::Revoked | FamilyState::Unknown => {
                return Err(Rejection::Revoked);
            },
        };

        if record.token_id != claims.jti || record.subject != claims.sub {
            tracing::warn!(
                %family,
                sub = %claims.sub,
                "refresh token reused, revoking family"
            );
            if let Err(err) = refresh::with_timeout(
                self.policy.store_timeout,
                self.store.revoke(family),
            )
            .await
            {
                tracing::error!(%err, %family, "failed to revoke refresh token family");
            }
            return Err(Rejection::Revoked);
        }

        Ok((claims, record))
    }
}
