//! Mint access and refresh tokens.

use std::collections::BTreeSet;
use std::sync::Arc;

use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use rand::Rng;

use super::{Claims, Header, Identity, SignedToken, TokenKind, TokenPolicy, codec};
use crate::keys::{KeyError, KeyMaterialProvider};
use crate::refresh::{self, RefreshRecord, RefreshTokenStore, StoreError};

const JTI_LENGTH: usize = 16;

type Result<T> = std::result::Result<T, IssueError>;

/// Errors raised while minting a token.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IssueError {
    #[error("invalid claims: {0}")]
    InvalidClaims(&'static str),
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error(transparent)]
    Encoding(#[from] codec::Malformed),
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The family moved on or was revoked while reissuing.
    #[error("refresh token family `{0}` is no longer usable")]
    Superseded(String),
}

fn token_id() -> String {
    OsRng
        .sample_iter(&Alphanumeric)
        .take(JTI_LENGTH)
        .map(char::from)
        .collect()
}

fn collect_scopes<I, S>(scopes: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    scopes.into_iter().map(Into::into).collect()
}

/// Token issuer.
pub struct TokenIssuer {
    keys: Arc<KeyMaterialProvider>,
    store: Arc<dyn RefreshTokenStore>,
    policy: TokenPolicy,
}

impl TokenIssuer {
    /// Create a new [`TokenIssuer`].
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

    pub fn policy(&self) -> &TokenPolicy {
        &self.policy
    }

    /// Create a signed access token.
    pub fn issue_access_token<I, S>(
        &self,
        identity: &Identity,
        scopes: I,
        now: u64,
    ) -> Result<SignedToken>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let claims = self.claims(
            identity,
            collect_scopes(scopes),
            TokenKind::Access,
            None,
            now,
        )?;
        self.sign(claims)
    }

    /// Create a refresh token opening a new family.
    ///
    /// The family is written to the refresh store before the token is
    /// returned.
    pub async fn issue_refresh_token<I, S>(
        &self,
        identity: &Identity,
        scopes: I,
        now: u64,
    ) -> Result<SignedToken>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let family = uuid::Uuid::new_v4().to_string();
        let claims = self.claims(
            identity,
            collect_scopes(scopes),
            TokenKind::Refresh,
            Some(family.clone()),
            now,
        )?;
        let token = self.sign(claims)?;

        refresh::with_timeout(
            self.policy.store_timeout,
            self.store.put(&family, record(&token.claims)),
        )
        .await?;

        tracing::debug!(sub = %identity, %family, "refresh token family opened");
        Ok(token)
    }

    /// Create the next refresh token of an existing family.
    ///
    /// `previous` is the `jti` of the token being exchanged. It must still be
    /// the current token of the family, otherwise [`IssueError::Superseded`]
    /// is returned and nothing is written.
    pub async fn reissue_refresh_token<I, S>(
        &self,
        family: &str,
        previous: &str,
        identity: &Identity,
        scopes: I,
        now: u64,
    ) -> Result<SignedToken>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let claims = self.claims(
            identity,
            collect_scopes(scopes),
            TokenKind::Refresh,
            Some(family.to_owned()),
            now,
        )?;
        let token = self.sign(claims)?;

        let advanced = refresh::with_timeout(
            self.policy.store_timeout,
            self.store.advance(family, previous, record(&token.claims)),
        )
        .await?;
        if !advanced {
            return Err(IssueError::Superseded(family.to_owned()));
        }

        Ok(token)
    }

    fn claims(
        &self,
        identity: &Identity,
        scopes: BTreeSet<String>,
        typ: TokenKind,
        fam: Option<String>,
        now: u64,
    ) -> Result<Claims> {
        let ttl = match typ {
            TokenKind::Access => self.policy.access_ttl,
            TokenKind::Refresh => self.policy.refresh_ttl,
        };
        if ttl == 0 {
            return Err(IssueError::InvalidClaims("ttl must be positive"));
        }
        let exp = now
            .checked_add(ttl)
            .ok_or(IssueError::InvalidClaims("expiration overflows"))?;

        Ok(Claims {
            sub: identity.as_str().to_owned(),
            iat: now,
            exp,
            iss: self.policy.issuer.clone(),
            aud: self.policy.audience.clone(),
            scopes,
            fam,
            typ,
            jti: token_id(),
        })
    }

    fn sign(&self, claims: Claims) -> Result<SignedToken> {
        let key = self.keys.current_signing_key();
        let header = Header::new(key.algorithm(), key.kid());
        let signing_input = codec::signing_input(&header, &claims)?;
        let signature = key.sign(signing_input.as_bytes())?;

        Ok(SignedToken {
            encoded: codec::seal(&signing_input, &signature),
            header,
            claims,
        })
    }
}

fn record(claims: &Claims) -> RefreshRecord {
    RefreshRecord {
        subject: claims.sub.clone(),
        scopes: claims.scopes.clone(),
        token_id: claims.jti.clone(),
        expires_at: claims.exp,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::keys::tests::hmac_key;
    use crate::refresh::{FamilyState, MemoryRefreshStore};

    fn issuer(store: Arc<MemoryRefreshStore>) -> TokenIssuer {
        let keys = Arc::new(KeyMaterialProvider::new(
            hmac_key("k1", 1),
            Duration::from_secs(60),
        ));
        TokenIssuer::new(keys, store, TokenPolicy::default())
    }

    fn identity() -> Identity {
        Identity::new("u1").unwrap()
    }

    #[test]
    fn test_access_token() {
        let store = Arc::new(MemoryRefreshStore::new());
        let token = issuer(store)
            .issue_access_token(&identity(), ["read", "write"], 1_000)
            .unwrap();

        assert_eq!(token.header.kid, "k1");
        assert_eq!(token.claims.sub, "u1");
        assert_eq!(token.claims.iat, 1_000);
        assert_eq!(token.claims.exp, 1_900);
        assert_eq!(token.claims.typ, TokenKind::Access);
        assert_eq!(token.claims.fam, None);
        assert_eq!(token.claims.jti.len(), JTI_LENGTH);
        assert_eq!(token.claims.scopes.len(), 2);
        assert_eq!(token.as_str().split('.').count(), 3);
    }

    #[test]
    fn test_token_ids_are_unique() {
        let store = Arc::new(MemoryRefreshStore::new());
        let issuer = issuer(store);
        let first = issuer
            .issue_access_token(&identity(), Vec::<String>::new(), 0)
            .unwrap();
        let second = issuer
            .issue_access_token(&identity(), Vec::<String>::new(), 0)
            .unwrap();

        assert_ne!(first.claims.jti, second.claims.jti);
        assert_ne!(first.as_str(), second.as_str());
    }

    #[test]
    fn test_invalid_ttl() {
        let keys = Arc::new(KeyMaterialProvider::new(
            hmac_key("k1", 1),
            Duration::from_secs(60),
        ));
        let issuer = TokenIssuer::new(
            keys,
            Arc::new(MemoryRefreshStore::new()),
            TokenPolicy {
                access_ttl: 0,
                ..Default::default()
            },
        );

        assert_eq!(
            issuer
                .issue_access_token(&identity(), ["read"], 0)
                .unwrap_err(),
            IssueError::InvalidClaims("ttl must be positive")
        );
    }

    #[test]
    fn test_expiration_overflow() {
        let store = Arc::new(MemoryRefreshStore::new());
        assert_eq!(
            issuer(store)
                .issue_access_token(&identity(), ["read"], u64::MAX)
                .unwrap_err(),
            IssueError::InvalidClaims("expiration overflows")
        );
    }

    #[tokio::test]
    async fn test_refresh_token_opens_family() {
        let store = Arc::new(MemoryRefreshStore::new());
        let token = issuer(Arc::clone(&store))
            .issue_refresh_token(&identity(), ["read"], 1_000)
            .await
            .unwrap();

        let family = token.claims.fam.clone().unwrap();
        assert_eq!(token.claims.typ, TokenKind::Refresh);
        assert_eq!(token.claims.exp, 1_000 + 7 * 24 * 3600);

        match store.get(&family).await.unwrap() {
            FamilyState::Active(record) => {
                assert_eq!(record.subject, "u1");
                assert_eq!(record.token_id, token.claims.jti);
                assert_eq!(record.expires_at, token.claims.exp);
            },
            other => panic!("unexpected family state: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_reissue_advances_family() {
        let store = Arc::new(MemoryRefreshStore::new());
        let issuer = issuer(Arc::clone(&store));
        let first = issuer
            .issue_refresh_token(&identity(), ["read"], 0)
            .await
            .unwrap();
        let family = first.claims.fam.clone().unwrap();

        let second = issuer
            .reissue_refresh_token(&family, &first.claims.jti, &identity(), ["read"], 10)
            .await
            .unwrap();
        assert_eq!(second.claims.fam.as_deref(), Some(family.as_str()));

        let err = issuer
            .reissue_refresh_token(&family, &first.claims.jti, &identity(), ["read"], 20)
            .await
            .unwrap_err();
        assert_eq!(err, IssueError::Superseded(family.clone()));
    }

    #[tokio::test]
    async fn test_signs_with_rotated_key() {
        let keys = Arc::new(KeyMaterialProvider::new(
            hmac_key("k1", 1),
            Duration::from_secs(60),
        ));
        let issuer = TokenIssuer::new(
            Arc::clone(&keys),
            Arc::new(MemoryRefreshStore::new()),
            TokenPolicy::default(),
        );
        keys.rotate(hmac_key("k2", 2), 0).unwrap();

        let token = issuer.issue_access_token(&identity(), ["read"], 0).unwrap();
        assert_eq!(token.header.kid, "k2");
    }
}
