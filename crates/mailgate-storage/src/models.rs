//! Database models

use chrono::{DateTime, Utc};
use mailgate_common::types::{InboxId, MessageId, ProjectId, TokenId, UserId, UserStatus};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// User model
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub email: String,
    /// PHC-format argon2 hash; `None` for accounts without a password
    #[serde(skip_serializing)]
    pub password_hash: Option<String>,
    pub status: String,
    pub password_login: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn status(&self) -> UserStatus {
        UserStatus::from_db(&self.status)
    }

    pub fn is_active(&self) -> bool {
        self.status() == UserStatus::Active
    }
}

/// Inbox model. One inbox is one mailbox, named by its email address.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Inbox {
    pub id: InboxId,
    pub project_id: ProjectId,
    pub email: String,
    pub created_at: Option<DateTime<Utc>>,
}

/// A message as persisted by the store
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: MessageId,
    pub inbox_id: InboxId,
    /// Protocol UID, assigned from the inbox counter at creation
    #[sqlx(try_from = "i64")]
    pub uid: u32,
    pub sender: String,
    pub receiver: String,
    pub subject: String,
    pub body: String,
    pub is_read: bool,
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
}

/// Input for message creation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMessage {
    pub inbox_id: InboxId,
    pub sender: String,
    pub receiver: String,
    pub subject: String,
    pub body: String,
}

/// Flag filters for listing messages. `None` means "either value".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MessageFilters {
    pub is_read: Option<bool>,
    pub is_deleted: Option<bool>,
}

impl MessageFilters {
    /// Messages not marked for deletion
    pub fn live() -> Self {
        Self {
            is_read: None,
            is_deleted: Some(false),
        }
    }

    /// Messages marked for deletion
    pub fn deleted() -> Self {
        Self {
            is_read: None,
            is_deleted: Some(true),
        }
    }

    /// Whether a message passes these filters
    pub fn matches(&self, message: &StoredMessage) -> bool {
        self.is_read.map_or(true, |v| message.is_read == v)
            && self.is_deleted.map_or(true, |v| message.is_deleted == v)
    }
}

/// API token. Only the SHA-256 digest of the secret is stored.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ApiToken {
    pub id: TokenId,
    pub user_id: UserId,
    pub token_hash: String,
    pub name: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ApiToken {
    /// Check if the token has expired at `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(false, |expires_at| expires_at < now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use uuid::Uuid;

    fn message(is_read: bool, is_deleted: bool) -> StoredMessage {
        StoredMessage {
            id: Uuid::new_v4(),
            inbox_id: Uuid::new_v4(),
            uid: 1,
            sender: "a@x.com".into(),
            receiver: "b@y.com".into(),
            subject: String::new(),
            body: String::new(),
            is_read,
            is_deleted,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_filters_match() {
        assert!(MessageFilters::default().matches(&message(true, true)));
        assert!(MessageFilters::live().matches(&message(true, false)));
        assert!(!MessageFilters::live().matches(&message(false, true)));
        assert!(MessageFilters::deleted().matches(&message(false, true)));

        let unread = MessageFilters {
            is_read: Some(false),
            is_deleted: Some(false),
        };
        assert!(unread.matches(&message(false, false)));
        assert!(!unread.matches(&message(true, false)));
    }

    #[test]
    fn test_token_expiry() {
        let now = Utc::now();
        let mut token = ApiToken {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            token_hash: "abc".into(),
            name: "cli".into(),
            expires_at: None,
            last_used_at: None,
            created_at: now,
        };
        assert!(!token.is_expired_at(now));

        token.expires_at = Some(now - Duration::minutes(1));
        assert!(token.is_expired_at(now));

        token.expires_at = Some(now + Duration::minutes(1));
        assert!(!token.is_expired_at(now));
    }
}
