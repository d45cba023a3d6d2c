//! Login, refresh and logout flows built on the issuer and the verifier.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::keys::KeyMaterialProvider;
use crate::refresh::{self, RefreshTokenStore, StoreError};
use crate::token::{
    Claims, Identity, IssueError, Malformed, Rejection, TokenIssuer,
    TokenPolicy, TokenVerifier,
};

const BEARER: &str = "Bearer";
pub const TOKEN_TYPE: &str = "Bearer";

/// Errors raised by [`SessionService`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Rejected(#[from] Rejection),
    #[error(transparent)]
    Issue(#[from] IssueError),
}

/// Tokens handed to a client after login or refresh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    /// Access token lifetime, in seconds.
    pub expires_in: u64,
}

/// Take the token out of an `Authorization` header value.
///
/// The scheme is matched case-insensitively and must be followed by exactly
/// one space.
pub fn extract_bearer(value: &str) -> Option<&str> {
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case(BEARER)
        || token.is_empty()
        || token.contains(char::is_whitespace)
    {
        return None;
    }
    Some(token)
}

/// Session orchestration.
pub struct SessionService {
    issuer: TokenIssuer,
    verifier: TokenVerifier,
    store: Arc<dyn RefreshTokenStore>,
    clock: Arc<dyn Clock>,
}

impl SessionService {
    /// Create a new [`SessionService`].
    pub fn new(
        keys: Arc<KeyMaterialProvider>,
        store: Arc<dyn RefreshTokenStore>,
        policy: TokenPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            issuer: TokenIssuer::new(
                Arc::clone(&keys),
                Arc::clone(&store),
                policy.clone(),
            ),
            verifier: TokenVerifier::new(keys, Arc::clone(&store), policy),
            store,
            clock,
        }
    }

    pub fn issuer(&self) -> &TokenIssuer {
        &self.issuer
    }

    pub fn verifier(&self) -> &TokenVerifier {
        &self.verifier
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    /// Issue a token pair for an already verified identity.
    #[tracing::instrument(skip(self, scopes), fields(sub = %identity))]
    pub async fn login<I, S>(
        &self,
        identity: &Identity,
        scopes: I,
    ) -> Result<TokenPair, SessionError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let now = self.clock.now();
        let scopes: Vec<String> = scopes.into_iter().map(Into::into).collect();

        let refresh = self
            .issuer
            .issue_refresh_token(identity, scopes.iter().cloned(), now)
            .await?;
        let access = self.issuer.issue_access_token(identity, scopes, now)?;

        tracing::info!("session opened");
        Ok(self.pair(access.into_string(), refresh.into_string()))
    }

    /// Exchange a refresh token for a new pair in the same family.
    ///
    /// The presented token can not be used again.
    #[tracing::instrument(skip_all)]
    pub async fn refresh(
        &self,
        refresh_token: &str,
    ) -> Result<TokenPair, SessionError> {
        let now = self.clock.now();
        let (claims, record) =
            self.verifier.verify_refresh(refresh_token, now).await?;
        let identity = Identity::new(record.subject)
            .ok_or(Rejection::Malformed(Malformed("empty subject")))?;
        let family = claims
            .fam
            .as_deref()
            .ok_or(Rejection::Malformed(Malformed("refresh token without family")))?;

        let refresh = match self
            .issuer
            .reissue_refresh_token(
                family,
                &claims.jti,
                &identity,
                record.scopes.iter().cloned(),
                now,
            )
            .await
        {
            Ok(token) => token,
            Err(IssueError::Superseded(family)) => {
                // Another request exchanged the same token first.
                tracing::warn!(%family, "concurrent refresh token reuse, revoking family");
                self.revoke(&family).await?;
                return Err(Rejection::Revoked.into());
            },
            Err(err) => return Err(err.into()),
        };
        let access =
            self.issuer.issue_access_token(&identity, record.scopes, now)?;

        tracing::debug!(sub = %identity, %family, "refresh token rotated");
        Ok(self.pair(access.into_string(), refresh.into_string()))
    }

    /// Revoke the family of `refresh_token`.
    #[tracing::instrument(skip_all)]
    pub async fn logout(&self, refresh_token: &str) -> Result<(), SessionError> {
        let now = self.clock.now();
        let (claims, _) =
            self.verifier.verify_refresh(refresh_token, now).await?;
        if let Some(family) = claims.fam.as_deref() {
            self.revoke(family).await?;
            tracing::info!(sub = %claims.sub, %family, "session closed");
        }
        Ok(())
    }

    /// Verify the access token carried by an `Authorization` header value.
    pub fn authenticate(&self, header: Option<&str>) -> Result<Claims, Rejection> {
        let header = header.ok_or(Malformed("missing bearer token"))?;
        let token =
            extract_bearer(header).ok_or(Malformed("expected bearer scheme"))?;
        self.verifier.verify_access(token, self.clock.now())
    }

    /// Forget refresh token families that can no longer verify.
    pub async fn prune_families(&self) -> Result<usize, StoreError> {
        let removed = refresh::with_timeout(
            self.issuer.policy().store_timeout,
            self.store.prune(self.clock.now()),
        )
        .await?;
        if removed > 0 {
            tracing::info!(removed, "expired refresh token families pruned");
        }
        Ok(removed)
    }

    async fn revoke(&self, family: &str) -> Result<(), Rejection> {
        refresh::with_timeout(
            self.issuer.policy().store_timeout,
            self.store.revoke(family),
        )
        .await
        .map_err(Rejection::from)
    }

    fn pair(&self, access_token: String, refresh_token: String) -> TokenPair {
        TokenPair {
            access_token,
            refresh_token,
            token_type: TOKEN_TYPE.to_owned(),
            expires_in: self.issuer.policy().access_ttl,
        }
    }
}
