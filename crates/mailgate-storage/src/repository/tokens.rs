//! API token repository

use crate::db::DatabasePool;
use crate::models::ApiToken;
use async_trait::async_trait;
use mailgate_common::types::TokenId;
use mailgate_common::{Error, Result};

/// API token repository trait
#[async_trait]
pub trait TokenRepository: Send + Sync {
    /// Find a token by the hex SHA-256 digest of its secret
    async fn get_by_hash(&self, token_hash: &str) -> Result<Option<ApiToken>>;

    /// Record a successful use
    async fn touch_last_used(&self, id: TokenId) -> Result<()>;

    /// Remove expired tokens, returning how many were removed
    async fn prune_expired(&self) -> Result<u64>;
}

/// Database API token repository
pub struct DbTokenRepository {
    pool: DatabasePool,
}

impl DbTokenRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TokenRepository for DbTokenRepository {
    async fn get_by_hash(&self, token_hash: &str) -> Result<Option<ApiToken>> {
        sqlx::query_as::<_, ApiToken>("SELECT * FROM api_tokens WHERE token_hash = $1")
            .bind(token_hash)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    async fn touch_last_used(&self, id: TokenId) -> Result<()> {
        sqlx::query("UPDATE api_tokens SET last_used_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    async fn prune_expired(&self) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM api_tokens WHERE expires_at IS NOT NULL AND expires_at < NOW()",
        )
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(result.rows_affected())
    }
}
