//! Message repository

use crate::db::DatabasePool;
use crate::models::{MessageFilters, NewMessage, StoredMessage};
use async_trait::async_trait;
use mailgate_common::types::{InboxId, MessageId};
use mailgate_common::{Error, Result};
use uuid::Uuid;

/// Message store trait
///
/// UIDs are allocated from a per-inbox counter when a message is created,
/// so they strictly increase within an inbox and are never reused, even
/// after the highest message has been removed.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Insert a message, assigning the next UID of its inbox
    async fn create(&self, input: NewMessage) -> Result<StoredMessage>;

    /// List messages in UID order. `limit == 0` means no limit. Returns the
    /// page and the total number of messages matching `filters`.
    async fn list_by_inbox(
        &self,
        inbox_id: InboxId,
        filters: MessageFilters,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<StoredMessage>, usize)>;

    /// Fetch messages by UID, including deleted ones, in UID order
    async fn get_by_uids(&self, inbox_id: InboxId, uids: &[u32]) -> Result<Vec<StoredMessage>>;

    /// Highest UID ever assigned in the inbox, 0 when none
    async fn get_max_uid(&self, inbox_id: InboxId) -> Result<u32>;

    /// Message id for a UID, if the message still exists
    async fn get_identity_for_uid(&self, inbox_id: InboxId, uid: u32) -> Result<Option<MessageId>>;

    /// Every existing UID in ascending order, deleted messages included
    async fn get_all_uids_including_deleted(&self, inbox_id: InboxId) -> Result<Vec<u32>>;

    async fn set_read(&self, id: MessageId, read: bool) -> Result<()>;

    async fn set_deleted(&self, id: MessageId, deleted: bool) -> Result<()>;

    /// Permanently remove a message
    async fn delete(&self, id: MessageId) -> Result<()>;
}

const MESSAGE_COLUMNS: &str =
    "id, inbox_id, uid, sender, receiver, subject, body, is_read, is_deleted, created_at";

/// Database message store
pub struct DbMessageStore {
    pool: DatabasePool,
}

impl DbMessageStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    async fn set_flag(&self, id: MessageId, column: &'static str, value: bool) -> Result<()> {
        let query = format!(
            "UPDATE messages SET {} = $2, updated_at = NOW() WHERE id = $1",
            column
        );

        let result = sqlx::query(&query)
            .bind(id)
            .bind(value)
            .execute(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("Message {}", id)));
        }

        Ok(())
    }
}

fn to_i64(values: &[u32]) -> Vec<i64> {
    values.iter().map(|&v| i64::from(v)).collect()
}

fn to_uid(value: i64) -> Result<u32> {
    u32::try_from(value).map_err(|_| Error::Storage(format!("UID out of range: {}", value)))
}

#[async_trait]
impl MessageStore for DbMessageStore {
    async fn create(&self, input: NewMessage) -> Result<StoredMessage> {
        let id = Uuid::now_v7();
        let now = chrono::Utc::now();

        // The counter bump and the insert run as one statement so two
        // concurrent deliveries can never observe the same UID.
        let query = format!(
            r#"
            WITH next AS (
                UPDATE inboxes SET last_uid = last_uid + 1
                WHERE id = $2
                RETURNING last_uid
            )
            INSERT INTO messages (id, inbox_id, uid, sender, receiver, subject, body, is_read, is_deleted, created_at, updated_at)
            SELECT $1, $2, next.last_uid, $3, $4, $5, $6, false, false, $7, $7 FROM next
            RETURNING {}
            "#,
            MESSAGE_COLUMNS
        );

        sqlx::query_as::<_, StoredMessage>(&query)
            .bind(id)
            .bind(input.inbox_id)
            .bind(&input.sender)
            .bind(&input.receiver)
            .bind(&input.subject)
            .bind(&input.body)
            .bind(now)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))?
            .ok_or_else(|| Error::NotFound(format!("Inbox {}", input.inbox_id)))
    }

    async fn list_by_inbox(
        &self,
        inbox_id: InboxId,
        filters: MessageFilters,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<StoredMessage>, usize)> {
        let limit = (limit > 0).then_some(limit as i64);

        let query = format!(
            r#"
            SELECT {} FROM messages
            WHERE inbox_id = $1
              AND ($2::boolean IS NULL OR is_read = $2)
              AND ($3::boolean IS NULL OR is_deleted = $3)
            ORDER BY uid ASC
            LIMIT $4 OFFSET $5
            "#,
            MESSAGE_COLUMNS
        );

        let messages = sqlx::query_as::<_, StoredMessage>(&query)
            .bind(inbox_id)
            .bind(filters.is_read)
            .bind(filters.is_deleted)
            .bind(limit)
            .bind(offset as i64)
            .fetch_all(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        let total: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM messages
            WHERE inbox_id = $1
              AND ($2::boolean IS NULL OR is_read = $2)
              AND ($3::boolean IS NULL OR is_deleted = $3)
            "#,
        )
        .bind(inbox_id)
        .bind(filters.is_read)
        .bind(filters.is_deleted)
        .fetch_one(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok((messages, total.max(0) as usize))
    }

    async fn get_by_uids(&self, inbox_id: InboxId, uids: &[u32]) -> Result<Vec<StoredMessage>> {
        if uids.is_empty() {
            return Ok(Vec::new());
        }

        let query = format!(
            "SELECT {} FROM messages WHERE inbox_id = $1 AND uid = ANY($2) ORDER BY uid ASC",
            MESSAGE_COLUMNS
        );

        sqlx::query_as::<_, StoredMessage>(&query)
            .bind(inbox_id)
            .bind(to_i64(uids))
            .fetch_all(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    async fn get_max_uid(&self, inbox_id: InboxId) -> Result<u32> {
        let last_uid: Option<i64> = sqlx::query_scalar("SELECT last_uid FROM inboxes WHERE id = $1")
            .bind(inbox_id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        match last_uid {
            Some(value) => to_uid(value),
            None => Err(Error::NotFound(format!("Inbox {}", inbox_id))),
        }
    }

    async fn get_identity_for_uid(&self, inbox_id: InboxId, uid: u32) -> Result<Option<MessageId>> {
        sqlx::query_scalar("SELECT id FROM messages WHERE inbox_id = $1 AND uid = $2")
            .bind(inbox_id)
            .bind(i64::from(uid))
            .fetch_optional(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    async fn get_all_uids_including_deleted(&self, inbox_id: InboxId) -> Result<Vec<u32>> {
        let uids: Vec<i64> =
            sqlx::query_scalar("SELECT uid FROM messages WHERE inbox_id = $1 ORDER BY uid ASC")
                .bind(inbox_id)
                .fetch_all(self.pool.pool())
                .await
                .map_err(|e| Error::Database(e.to_string()))?;

        uids.into_iter().map(to_uid).collect()
    }

    async fn set_read(&self, id: MessageId, read: bool) -> Result<()> {
        self.set_flag(id, "is_read", read).await
    }

    async fn set_deleted(&self, id: MessageId, deleted: bool) -> Result<()> {
        self.set_flag(id, "is_deleted", deleted).await
    }

    async fn delete(&self, id: MessageId) -> Result<()> {
        let result = sqlx::query("DELETE FROM messages WHERE id = $1")
            .bind(id)
            .execute(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("Message {}", id)));
        }

        Ok(())
    }
}
