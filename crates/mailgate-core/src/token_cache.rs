//! API token cache
//!
//! Resolved tokens are kept for a short TTL so that submission logins do not
//! hit the database on every connection. A background task prunes stale
//! entries and expired tokens until it is cancelled at shutdown.

use mailgate_common::Result;
use mailgate_storage::{ApiToken, TokenRepository};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
struct CachedToken {
    token: ApiToken,
    cached_at: Instant,
}

/// Cache of API tokens keyed by the SHA-256 hex digest of the secret
pub struct TokenCache {
    repo: Arc<dyn TokenRepository>,
    entries: RwLock<HashMap<String, CachedToken>>,
    ttl: Duration,
}

impl TokenCache {
    pub fn new(repo: Arc<dyn TokenRepository>, ttl: Duration) -> Self {
        Self {
            repo,
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Digest under which a token secret is stored
    pub fn hash_token(secret: &str) -> String {
        hex::encode(Sha256::digest(secret.as_bytes()))
    }

    /// Resolve a token secret. Expired tokens are never returned.
    pub async fn lookup(&self, secret: &str) -> Result<Option<ApiToken>> {
        let hash = Self::hash_token(secret);
        let now = chrono::Utc::now();

        {
            let entries = self.entries.read().await;
            if let Some(cached) = entries.get(&hash) {
                if cached.cached_at.elapsed() < self.ttl && !cached.token.is_expired_at(now) {
                    return Ok(Some(cached.token.clone()));
                }
            }
        }

        let token = self.repo.get_by_hash(&hash).await?;
        let mut entries = self.entries.write().await;
        match token {
            Some(token) if !token.is_expired_at(now) => {
                entries.insert(
                    hash,
                    CachedToken {
                        token: token.clone(),
                        cached_at: Instant::now(),
                    },
                );
                Ok(Some(token))
            }
            _ => {
                entries.remove(&hash);
                Ok(None)
            }
        }
    }

    /// Record a successful use without holding up the caller
    pub fn touch(&self, token: &ApiToken) {
        let repo = self.repo.clone();
        let id = token.id;
        tokio::spawn(async move {
            if let Err(e) = repo.touch_last_used(id).await {
                warn!(token_id = %id, error = %e, "Failed to update token last_used_at");
            }
        });
    }

    /// Drop stale cache entries and delete expired tokens from the store
    pub async fn prune(&self) -> Result<u64> {
        let now = chrono::Utc::now();
        let evicted = {
            let mut entries = self.entries.write().await;
            let before = entries.len();
            entries.retain(|_, cached| {
                cached.cached_at.elapsed() < self.ttl && !cached.token.is_expired_at(now)
            });
            before - entries.len()
        };

        let removed = self.repo.prune_expired().await?;
        debug!(evicted, removed, "Token cache pruned");
        Ok(removed)
    }

    /// Number of cached entries
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Run [`prune`](Self::prune) every `interval` until `cancel` fires
    pub fn spawn_pruner(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("Token pruner stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = cache.prune().await {
                            warn!(error = %e, "Token prune failed");
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use mailgate_storage::MemoryStore;
    use uuid::Uuid;

    fn token(user_id: Uuid, secret: &str, expires_in: Option<chrono::Duration>) -> ApiToken {
        ApiToken {
            id: Uuid::new_v4(),
            user_id,
            token_hash: TokenCache::hash_token(secret),
            name: "test".to_string(),
            expires_at: expires_in.map(|d| Utc::now() + d),
            last_used_at: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_hash_token() {
        assert_eq!(
            TokenCache::hash_token("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn test_lookup_caches_live_tokens() {
        let store = Arc::new(MemoryStore::new());
        let user = store.add_user("kermit", None).unwrap();
        store.insert_token(token(user.id, "s3cret", None)).unwrap();
        let cache = TokenCache::new(store.clone(), Duration::from_secs(60));

        let found = cache.lookup("s3cret").await.unwrap().unwrap();
        assert_eq!(found.user_id, user.id);
        assert_eq!(cache.len().await, 1);

        assert!(cache.lookup("wrong").await.unwrap().is_none());
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn test_expired_tokens_are_rejected() {
        let store = Arc::new(MemoryStore::new());
        let user = store.add_user("kermit", None).unwrap();
        store
            .insert_token(token(user.id, "old", Some(chrono::Duration::minutes(-5))))
            .unwrap();
        let cache = TokenCache::new(store.clone(), Duration::from_secs(60));

        assert!(cache.lookup("old").await.unwrap().is_none());
        assert_eq!(cache.prune().await.unwrap(), 1);
        assert!(store
            .get_by_hash(&TokenCache::hash_token("old"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_prune_evicts_stale_entries() {
        let store = Arc::new(MemoryStore::new());
        let user = store.add_user("kermit", None).unwrap();
        store.insert_token(token(user.id, "fresh", None)).unwrap();
        let cache = TokenCache::new(store, Duration::ZERO);

        cache.lookup("fresh").await.unwrap();
        cache.prune().await.unwrap();
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pruner_stops_on_cancel() {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(TokenCache::new(store, Duration::from_secs(60)));
        let cancel = CancellationToken::new();

        let handle = cache.spawn_pruner(Duration::from_secs(3600), cancel.clone());
        tokio::time::advance(Duration::from_secs(7200)).await;
        cancel.cancel();
        handle.await.unwrap();
    }
}
