//! Refresh token families persistence.
//!
//! A family is created at login and carries every refresh token rotated from
//! it. The store only knows the family id, its owner and the id of the one
//! refresh token of the family that is still usable.

mod memory;
mod postgres;

use std::collections::BTreeSet;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;

pub use memory::MemoryRefreshStore;
pub use postgres::PgRefreshStore;

/// Errors returned by a [`RefreshTokenStore`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("refresh token store did not answer within {0:?}")]
    Timeout(Duration),
    #[error("refresh token store failed: {0}")]
    Backend(String),
}

/// What the store remembers about a family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshRecord {
    /// Subject the family was issued to.
    pub subject: String,
    /// Scopes granted at login, carried over on every refresh.
    pub scopes: BTreeSet<String>,
    /// `jti` of the only refresh token of the family still usable.
    pub token_id: String,
    /// Expiry of that token. Past it, nothing of the family can verify.
    pub expires_at: u64,
}

/// Result of a family lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FamilyState {
    Active(RefreshRecord),
    Revoked,
    Unknown,
}

/// Port for refresh token families.
#[async_trait]
pub trait RefreshTokenStore: Send + Sync {
    /// Create or overwrite a family record.
    ///
    /// A revoked family stays revoked.
    async fn put(
        &self,
        family: &str,
        record: RefreshRecord,
    ) -> Result<(), StoreError>;

    /// Find a family.
    async fn get(&self, family: &str) -> Result<FamilyState, StoreError>;

    /// Revoke a family. Unknown families are ignored.
    async fn revoke(&self, family: &str) -> Result<(), StoreError>;

    /// Replace the record of an active family only if its current token id is
    /// `expected`.
    ///
    /// Returns `false` when the family is unknown, revoked, or already moved
    /// to another token id.
    async fn advance(
        &self,
        family: &str,
        expected: &str,
        record: RefreshRecord,
    ) -> Result<bool, StoreError>;

    /// Forget every family, revoked or not, with `expires_at <= now`.
    ///
    /// Returns how many families were removed.
    async fn prune(&self, now: u64) -> Result<usize, StoreError>;
}

/// Run a store call bounded by `timeout`.
pub async fn with_timeout<T, F>(timeout: Duration, call: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    tokio::time::timeout(timeout, call)
        .await
        .map_err(|_| StoreError::Timeout(timeout))?
}
