//! In-memory store
//!
//! Implements every repository trait over a single mutex-guarded state.
//! Semantics mirror the PostgreSQL repositories, including the per-inbox
//! UID counter.

use crate::models::{ApiToken, Inbox, MessageFilters, NewMessage, StoredMessage, User};
use crate::repository::{InboxRepository, MessageStore, TokenRepository, UserRepository};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mailgate_common::types::{InboxId, MessageId, ProjectId, TokenId, UserId, UserStatus};
use mailgate_common::{Error, Result};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

struct InboxEntry {
    inbox: Inbox,
    last_uid: u32,
}

#[derive(Default)]
struct State {
    users: HashMap<UserId, User>,
    memberships: HashSet<(ProjectId, UserId)>,
    inboxes: Vec<InboxEntry>,
    messages: Vec<StoredMessage>,
    tokens: HashMap<TokenId, ApiToken>,
    #[cfg(any(test, feature = "test-util"))]
    failing: HashSet<MessageId>,
}

impl State {
    fn inbox_mut(&mut self, inbox_id: InboxId) -> Result<&mut InboxEntry> {
        self.inboxes
            .iter_mut()
            .find(|entry| entry.inbox.id == inbox_id)
            .ok_or_else(|| Error::NotFound(format!("Inbox {}", inbox_id)))
    }

    fn message_mut(&mut self, id: MessageId) -> Result<&mut StoredMessage> {
        #[cfg(any(test, feature = "test-util"))]
        if self.failing.contains(&id) {
            return Err(Error::Storage(format!("Injected failure for message {}", id)));
        }
        self.messages
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or_else(|| Error::NotFound(format!("Message {}", id)))
    }

    fn sorted_messages(&self, inbox_id: InboxId) -> Vec<&StoredMessage> {
        let mut messages: Vec<&StoredMessage> = self
            .messages
            .iter()
            .filter(|m| m.inbox_id == inbox_id)
            .collect();
        messages.sort_by_key(|m| m.uid);
        messages
    }

    fn is_member(&self, project_id: ProjectId, user_id: UserId) -> bool {
        self.memberships.contains(&(project_id, user_id))
    }
}

/// In-memory implementation of all repositories
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| Error::Internal("memory store lock poisoned".to_string()))
    }

    /// Add an active user allowed to log in with a password
    pub fn add_user(&self, username: &str, password_hash: Option<String>) -> Result<User> {
        let now = Utc::now();
        let user = User {
            id: Uuid::now_v7(),
            username: username.to_string(),
            email: String::new(),
            password_hash,
            status: UserStatus::Active.to_string(),
            password_login: true,
            created_at: now,
            updated_at: now,
        };
        self.insert_user(user.clone())?;
        Ok(user)
    }

    /// Insert or replace a user
    pub fn insert_user(&self, user: User) -> Result<()> {
        self.state()?.users.insert(user.id, user);
        Ok(())
    }

    /// Grant a user access to every inbox of a project
    pub fn add_project_member(&self, project_id: ProjectId, user_id: UserId) -> Result<()> {
        self.state()?.memberships.insert((project_id, user_id));
        Ok(())
    }

    /// Create an inbox with a fresh UID counter
    pub fn add_inbox(&self, project_id: ProjectId, email: &str) -> Result<Inbox> {
        let inbox = Inbox {
            id: Uuid::now_v7(),
            project_id,
            email: email.to_string(),
            created_at: Some(Utc::now()),
        };
        self.insert_inbox(inbox.clone())?;
        Ok(inbox)
    }

    pub fn insert_inbox(&self, inbox: Inbox) -> Result<()> {
        let mut state = self.state()?;
        if state
            .inboxes
            .iter()
            .any(|entry| entry.inbox.email.eq_ignore_ascii_case(&inbox.email))
        {
            return Err(Error::Validation(format!("Inbox {} already exists", inbox.email)));
        }
        state.inboxes.push(InboxEntry { inbox, last_uid: 0 });
        Ok(())
    }

    /// Move the UID counter so the next message gets `last_uid + 1`
    pub fn set_last_uid(&self, inbox_id: InboxId, last_uid: u32) -> Result<()> {
        self.state()?.inbox_mut(inbox_id)?.last_uid = last_uid;
        Ok(())
    }

    /// Override the creation time of a stored message
    pub fn set_created_at(&self, id: MessageId, created_at: DateTime<Utc>) -> Result<()> {
        let mut state = self.state()?;
        let message = state
            .messages
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or_else(|| Error::NotFound(format!("Message {}", id)))?;
        message.created_at = created_at;
        Ok(())
    }

    pub fn insert_token(&self, token: ApiToken) -> Result<()> {
        self.state()?.tokens.insert(token.id, token);
        Ok(())
    }

    /// Make every later mutation of `id` fail with a storage error
    #[cfg(any(test, feature = "test-util"))]
    pub fn fail_mutations_for(&self, id: MessageId) -> Result<()> {
        self.state()?.failing.insert(id);
        Ok(())
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn create(&self, input: NewMessage) -> Result<StoredMessage> {
        let mut state = self.state()?;
        let entry = state.inbox_mut(input.inbox_id)?;
        let uid = entry
            .last_uid
            .checked_add(1)
            .ok_or_else(|| Error::Storage("UID space exhausted".to_string()))?;
        entry.last_uid = uid;

        let message = StoredMessage {
            id: Uuid::now_v7(),
            inbox_id: input.inbox_id,
            uid,
            sender: input.sender,
            receiver: input.receiver,
            subject: input.subject,
            body: input.body,
            is_read: false,
            is_deleted: false,
            created_at: Utc::now(),
        };
        state.messages.push(message.clone());
        Ok(message)
    }

    async fn list_by_inbox(
        &self,
        inbox_id: InboxId,
        filters: MessageFilters,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<StoredMessage>, usize)> {
        let state = self.state()?;
        let matching: Vec<&StoredMessage> = state
            .sorted_messages(inbox_id)
            .into_iter()
            .filter(|m| filters.matches(m))
            .collect();
        let total = matching.len();
        let take = if limit == 0 { usize::MAX } else { limit };

        let page = matching
            .into_iter()
            .skip(offset)
            .take(take)
            .cloned()
            .collect();
        Ok((page, total))
    }

    async fn get_by_uids(&self, inbox_id: InboxId, uids: &[u32]) -> Result<Vec<StoredMessage>> {
        let wanted: HashSet<u32> = uids.iter().copied().collect();
        let state = self.state()?;
        Ok(state
            .sorted_messages(inbox_id)
            .into_iter()
            .filter(|m| wanted.contains(&m.uid))
            .cloned()
            .collect())
    }

    async fn get_max_uid(&self, inbox_id: InboxId) -> Result<u32> {
        Ok(self.state()?.inbox_mut(inbox_id)?.last_uid)
    }

    async fn get_identity_for_uid(&self, inbox_id: InboxId, uid: u32) -> Result<Option<MessageId>> {
        Ok(self
            .state()?
            .messages
            .iter()
            .find(|m| m.inbox_id == inbox_id && m.uid == uid)
            .map(|m| m.id))
    }

    async fn get_all_uids_including_deleted(&self, inbox_id: InboxId) -> Result<Vec<u32>> {
        let state = self.state()?;
        Ok(state.sorted_messages(inbox_id).iter().map(|m| m.uid).collect())
    }

    async fn set_read(&self, id: MessageId, read: bool) -> Result<()> {
        self.state()?.message_mut(id)?.is_read = read;
        Ok(())
    }

    async fn set_deleted(&self, id: MessageId, deleted: bool) -> Result<()> {
        self.state()?.message_mut(id)?.is_deleted = deleted;
        Ok(())
    }

    async fn delete(&self, id: MessageId) -> Result<()> {
        let mut state = self.state()?;
        state.message_mut(id)?;
        state.messages.retain(|m| m.id != id);
        Ok(())
    }
}

#[async_trait]
impl InboxRepository for MemoryStore {
    async fn get_by_email(&self, email: &str) -> Result<Option<Inbox>> {
        Ok(self
            .state()?
            .inboxes
            .iter()
            .find(|entry| entry.inbox.email.eq_ignore_ascii_case(email))
            .map(|entry| entry.inbox.clone()))
    }

    async fn get_by_email_for_user(&self, email: &str, user_id: UserId) -> Result<Option<Inbox>> {
        let state = self.state()?;
        Ok(state
            .inboxes
            .iter()
            .find(|entry| {
                entry.inbox.email.eq_ignore_ascii_case(email)
                    && state.is_member(entry.inbox.project_id, user_id)
            })
            .map(|entry| entry.inbox.clone()))
    }

    async fn list_by_user(&self, user_id: UserId) -> Result<Vec<Inbox>> {
        let state = self.state()?;
        let mut inboxes: Vec<Inbox> = state
            .inboxes
            .iter()
            .filter(|entry| state.is_member(entry.inbox.project_id, user_id))
            .map(|entry| entry.inbox.clone())
            .collect();
        // Oldest first, inboxes without a creation time last
        inboxes.sort_by_key(|inbox| (inbox.created_at.is_none(), inbox.created_at));
        Ok(inboxes)
    }
}

#[async_trait]
impl UserRepository for MemoryStore {
    async fn get(&self, id: UserId) -> Result<Option<User>> {
        Ok(self.state()?.users.get(&id).cloned())
    }

    async fn get_by_username(&self, username: &str) -> Result<Option<User>> {
        Ok(self
            .state()?
            .users
            .values()
            .find(|user| user.username == username)
            .cloned())
    }
}

#[async_trait]
impl TokenRepository for MemoryStore {
    async fn get_by_hash(&self, token_hash: &str) -> Result<Option<ApiToken>> {
        Ok(self
            .state()?
            .tokens
            .values()
            .find(|token| token.token_hash == token_hash)
            .cloned())
    }

    async fn touch_last_used(&self, id: TokenId) -> Result<()> {
        if let Some(token) = self.state()?.tokens.get_mut(&id) {
            token.last_used_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn prune_expired(&self) -> Result<u64> {
        let now = Utc::now();
        let mut state = self.state()?;
        let before = state.tokens.len();
        state.tokens.retain(|_, token| !token.is_expired_at(now));
        Ok((before - state.tokens.len()) as u64)
    }
}
