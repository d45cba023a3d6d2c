//! In-memory refresh token store.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{FamilyState, RefreshRecord, RefreshTokenStore, StoreError};

#[derive(Debug)]
struct Family {
    record: RefreshRecord,
    revoked: bool,
}

/// Process-local store, lost on restart.
#[derive(Debug, Default)]
pub struct MemoryRefreshStore {
    families: RwLock<HashMap<String, Family>>,
}

impl MemoryRefreshStore {
    /// Create a new [`MemoryRefreshStore`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of known families, revoked ones included.
    pub async fn len(&self) -> usize {
        self.families.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.families.read().await.is_empty()
    }
}

#[async_trait]
impl RefreshTokenStore for MemoryRefreshStore {
    async fn put(
        &self,
        family: &str,
        record: RefreshRecord,
    ) -> Result<(), StoreError> {
        let mut families = self.families.write().await;
        match families.get_mut(family) {
            Some(existing) => existing.record = record,
            None => {
                families.insert(
                    family.to_owned(),
                    Family {
                        record,
                        revoked: false,
                    },
                );
            },
        }
        Ok(())
    }

    async fn get(&self, family: &str) -> Result<FamilyState, StoreError> {
        Ok(match self.families.read().await.get(family) {
            Some(Family { revoked: true, .. }) => FamilyState::Revoked,
            Some(Family { record, .. }) => FamilyState::Active(record.clone()),
            None => FamilyState::Unknown,
        })
    }

    async fn revoke(&self, family: &str) -> Result<(), StoreError> {
        if let Some(existing) = self.families.write().await.get_mut(family) {
            existing.revoked = true;
        }
        Ok(())
    }

    async fn advance(
        &self,
        family: &str,
        expected: &str,
        record: RefreshRecord,
    ) -> Result<bool, StoreError> {
        let mut families = self.families.write().await;
        match families.get_mut(family) {
            Some(existing)
                if !existing.revoked && existing.record.token_id == expected =>
            {
                existing.record = record;
                Ok(true)
            },
            _ => Ok(false),
        }
    }

    async fn prune(&self, now: u64) -> Result<usize, StoreError> {
        let mut families = self.families.write().await;
        let before = families.len();
        families.retain(|_, family| family.record.expires_at > now);
        Ok(before - families.len())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;

    fn record(token_id: &str) -> RefreshRecord {
        RefreshRecord {
            subject: "u1".into(),
            scopes: BTreeSet::from(["read".to_string()]),
            token_id: token_id.into(),
            expires_at: 1_000,
        }
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let store = MemoryRefreshStore::new();
        assert!(store.is_empty().await);
        assert_eq!(store.get("fam").await.unwrap(), FamilyState::Unknown);

        store.put("fam", record("t1")).await.unwrap();
        assert_eq!(
            store.get("fam").await.unwrap(),
            FamilyState::Active(record("t1"))
        );

        store.revoke("fam").await.unwrap();
        assert_eq!(store.get("fam").await.unwrap(), FamilyState::Revoked);

        // A put never resurrects a revoked family.
        store.put("fam", record("t2")).await.unwrap();
        assert_eq!(store.get("fam").await.unwrap(), FamilyState::Revoked);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_revoke_unknown() {
        let store = MemoryRefreshStore::new();
        store.revoke("missing").await.unwrap();
        assert_eq!(store.get("missing").await.unwrap(), FamilyState::Unknown);
    }

    #[tokio::test]
    async fn test_advance() {
        let store = MemoryRefreshStore::new();
        store.put("fam", record("t1")).await.unwrap();

        assert!(!store.advance("fam", "t0", record("t2")).await.unwrap());
        assert!(store.advance("fam", "t1", record("t2")).await.unwrap());
        assert!(!store.advance("fam", "t1", record("t3")).await.unwrap());
        assert_eq!(
            store.get("fam").await.unwrap(),
            FamilyState::Active(record("t2"))
        );

        store.revoke("fam").await.unwrap();
        assert!(!store.advance("fam", "t2", record("t3")).await.unwrap());
        assert!(!store.advance("other", "t1", record("t2")).await.unwrap());
    }

    #[tokio::test]
    async fn test_prune() {
        let store = MemoryRefreshStore::new();
        store.put("old", record("t1")).await.unwrap();
        store.put("revoked", record("t2")).await.unwrap();
        store.revoke("revoked").await.unwrap();
        store
            .put(
                "live",
                RefreshRecord {
                    expires_at: 2_000,
                    ..record("t3")
                },
            )
            .await
            .unwrap();

        assert_eq!(store.prune(999).await.unwrap(), 0);
        assert_eq!(store.prune(1_000).await.unwrap(), 2);
        assert_eq!(store.len().await, 1);
        assert_eq!(store.get("old").await.unwrap(), FamilyState::Unknown);
        assert_eq!(store.get("revoked").await.unwrap(), FamilyState::Unknown);
        assert!(matches!(
            store.get("live").await.unwrap(),
            FamilyState::Active(_)
        ));
    }
}
