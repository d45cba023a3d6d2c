//! PostgreSQL implementation of [`RefreshTokenStore`].

use std::collections::BTreeSet;

use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use super::{FamilyState, RefreshRecord, RefreshTokenStore, StoreError};

const DEFAULT_POOL_SIZE: u32 = 5;

fn backend(err: sqlx::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

/// Scopes are kept one per array element, never joined.
fn scopes_column(scopes: &BTreeSet<String>) -> Vec<String> {
    scopes.iter().cloned().collect()
}

fn timestamp_column(timestamp: u64) -> i64 {
    i64::try_from(timestamp).unwrap_or(i64::MAX)
}

/// PostgreSQL refresh token store.
#[derive(Debug, Clone)]
pub struct PgRefreshStore {
    pool: PgPool,
}

impl PgRefreshStore {
    /// Create a new [`PgRefreshStore`] from an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to `url` and make sure the table exists.
    pub async fn connect(
        url: &str,
        pool_size: Option<u32>,
    ) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(pool_size.unwrap_or(DEFAULT_POOL_SIZE))
            .connect(url)
            .await
            .map_err(backend)?;

        let store = Self::new(pool);
        store.migrate().await?;
        Ok(store)
    }

    /// Create the `refresh_token_families` table if missing.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS refresh_token_families (
                family TEXT PRIMARY KEY,
                subject TEXT NOT NULL,
                scopes TEXT[] NOT NULL,
                token_id TEXT NOT NULL,
                expires_at BIGINT NOT NULL,
                revoked BOOLEAN NOT NULL DEFAULT false,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        Ok(())
    }
}

#[async_trait]
impl RefreshTokenStore for PgRefreshStore {
    async fn put(
        &self,
        family: &str,
        record: RefreshRecord,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO refresh_token_families
                (family, subject, scopes, token_id, expires_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (family) DO UPDATE
            SET subject = EXCLUDED.subject,
                scopes = EXCLUDED.scopes,
                token_id = EXCLUDED.token_id,
                expires_at = EXCLUDED.expires_at,
                updated_at = NOW()
            "#,
        )
        .bind(family)
        .bind(&record.subject)
        .bind(scopes_column(&record.scopes))
        .bind(&record.token_id)
        .bind(timestamp_column(record.expires_at))
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        Ok(())
    }

    async fn get(&self, family: &str) -> Result<FamilyState, StoreError> {
        let row = sqlx::query_as::<_, (String, Vec<String>, String, i64, bool)>(
            r#"
            SELECT subject, scopes, token_id, expires_at, revoked
            FROM refresh_token_families
            WHERE family = $1
            "#,
        )
        .bind(family)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        Ok(match row {
            Some((_, _, _, _, true)) => FamilyState::Revoked,
            Some((subject, scopes, token_id, expires_at, false)) => {
                FamilyState::Active(RefreshRecord {
                    subject,
                    scopes: scopes.into_iter().collect(),
                    token_id,
                    expires_at: u64::try_from(expires_at).unwrap_or_default(),
                })
            },
            None => FamilyState::Unknown,
        })
    }

    async fn revoke(&self, family: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE refresh_token_families
            SET revoked = true, updated_at = NOW()
            WHERE family = $1
            "#,
        )
        .bind(family)
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        Ok(())
    }

    async fn advance(
        &self,
        family: &str,
        expected: &str,
        record: RefreshRecord,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE refresh_token_families
            SET subject = $3,
                scopes = $4,
                token_id = $5,
                expires_at = $6,
                updated_at = NOW()
            WHERE family = $1
              AND token_id = $2
              AND revoked = false
            "#,
        )
        .bind(family)
        .bind(expected)
        .bind(&record.subject)
        .bind(scopes_column(&record.scopes))
        .bind(&record.token_id)
        .bind(timestamp_column(record.expires_at))
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        Ok(result.rows_affected() == 1)
    }

    async fn prune(&self, now: u64) -> Result<usize, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM refresh_token_families
            WHERE expires_at <= $1
            "#,
        )
        .bind(timestamp_column(now))
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        Ok(usize::try_from(result.rows_affected()).unwrap_or(usize::MAX))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scopes_column() {
        let scopes = BTreeSet::from([
            "read write".to_string(),
            String::new(),
            "admin".to_string(),
        ]);
        let column = scopes_column(&scopes);

        assert_eq!(column, ["", "admin", "read write"]);
        assert_eq!(column.into_iter().collect::<BTreeSet<_>>(), scopes);
    }

    #[test]
    fn test_timestamp_column() {
        assert_eq!(timestamp_column(1_700_000_000), 1_700_000_000);
        assert_eq!(timestamp_column(u64::MAX), i64::MAX);
    }
}
