//! Inbox repository

use crate::db::DatabasePool;
use crate::models::Inbox;
use async_trait::async_trait;
use mailgate_common::types::UserId;
use mailgate_common::{Error, Result};
use tracing::debug;

/// Inbox repository trait
#[async_trait]
pub trait InboxRepository: Send + Sync {
    /// Look up an inbox by its exact address (case-insensitive)
    async fn get_by_email(&self, email: &str) -> Result<Option<Inbox>>;

    /// Look up an inbox by address, restricted to inboxes the user can reach
    /// through project membership
    async fn get_by_email_for_user(&self, email: &str, user_id: UserId) -> Result<Option<Inbox>>;

    /// All inboxes the user can reach, oldest first
    async fn list_by_user(&self, user_id: UserId) -> Result<Vec<Inbox>>;

    /// Exact lookup, then a retry with the local part cut at its first '.'
    /// so that `kermit.the.frog@example.org` reaches `kermit@example.org`.
    async fn get_by_email_with_wildcard(&self, email: &str) -> Result<Option<Inbox>> {
        if let Some(inbox) = self.get_by_email(email).await? {
            return Ok(Some(inbox));
        }

        match wildcard_base(email) {
            Some(base) => {
                debug!(email = %email, base = %base, "Retrying inbox lookup with base address");
                self.get_by_email(&base).await
            }
            None => Ok(None),
        }
    }
}

/// `local.suffix@domain` -> `local@domain`; `None` when there is no suffix
pub fn wildcard_base(email: &str) -> Option<String> {
    let (local, domain) = email.rsplit_once('@')?;
    let (base, _) = local.split_once('.')?;
    if base.is_empty() || domain.is_empty() {
        return None;
    }
    Some(format!("{}@{}", base, domain))
}

const INBOX_COLUMNS: &str = "i.id, i.project_id, i.email, i.created_at";

/// Database inbox repository
pub struct DbInboxRepository {
    pool: DatabasePool,
}

impl DbInboxRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl InboxRepository for DbInboxRepository {
    async fn get_by_email(&self, email: &str) -> Result<Option<Inbox>> {
        let query = format!(
            "SELECT {} FROM inboxes i WHERE LOWER(i.email) = LOWER($1)",
            INBOX_COLUMNS
        );

        sqlx::query_as::<_, Inbox>(&query)
            .bind(email)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    async fn get_by_email_for_user(&self, email: &str, user_id: UserId) -> Result<Option<Inbox>> {
        let query = format!(
            r#"
            SELECT {} FROM inboxes i
            JOIN project_users pu ON pu.project_id = i.project_id
            WHERE LOWER(i.email) = LOWER($1) AND pu.user_id = $2
            LIMIT 1
            "#,
            INBOX_COLUMNS
        );

        sqlx::query_as::<_, Inbox>(&query)
            .bind(email)
            .bind(user_id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    async fn list_by_user(&self, user_id: UserId) -> Result<Vec<Inbox>> {
        let query = format!(
            r#"
            SELECT DISTINCT {} FROM inboxes i
            JOIN project_users pu ON pu.project_id = i.project_id
            WHERE pu.user_id = $1
            ORDER BY i.created_at ASC NULLS LAST, i.id ASC
            "#,
            INBOX_COLUMNS
        );

        sqlx::query_as::<_, Inbox>(&query)
            .bind(user_id)
            .fetch_all(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wildcard_base() {
        assert_eq!(
            wildcard_base("kermit.the.frog@example.org").as_deref(),
            Some("kermit@example.org")
        );
        assert_eq!(wildcard_base("kermit@example.org"), None);
        assert_eq!(wildcard_base(".hidden@example.org"), None);
        assert_eq!(wildcard_base("no-at-sign"), None);
    }
}
