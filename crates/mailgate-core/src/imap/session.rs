//! IMAP Session management
//!
//! Manages the state of an IMAP connection including authentication
//! and selected mailbox state.

use super::mailbox::Mailbox;
use chrono::{DateTime, Utc};
use mailgate_storage::User;
use uuid::Uuid;

/// IMAP session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Not authenticated
    NotAuthenticated,
    /// Authenticated but no mailbox selected
    Authenticated,
    /// Mailbox selected for read-write
    Selected,
    /// Mailbox selected for read-only (EXAMINE)
    ReadOnly,
    /// Session is closing
    Logout,
}

/// Selected mailbox and the UID listing last reported to the client
#[derive(Clone)]
pub struct SelectedMailbox {
    pub mailbox: Mailbox,
    /// Deleted-inclusive UIDs, ascending; position + 1 is the sequence number
    pub uids: Vec<u32>,
}

impl SelectedMailbox {
    pub fn new(mailbox: Mailbox, uids: Vec<u32>) -> Self {
        Self { mailbox, uids }
    }

    /// Replace the listing and return the sequence numbers to report as
    /// expunged, adjusted for the removals reported before each one
    pub fn sync(&mut self, current: Vec<u32>) -> Vec<u32> {
        let mut expunged = Vec::new();
        let mut removed = 0u32;
        for (idx, uid) in self.uids.iter().enumerate() {
            if current.binary_search(uid).is_err() {
                expunged.push(idx as u32 + 1 - removed);
                removed += 1;
            }
        }
        self.uids = current;
        expunged
    }

    /// Number of messages the client currently knows about
    pub fn exists(&self) -> u32 {
        u32::try_from(self.uids.len()).unwrap_or(u32::MAX)
    }
}

/// IMAP Session
pub struct ImapSession {
    /// Session ID
    pub id: String,
    /// Current state
    pub state: SessionState,
    /// Authenticated user
    pub user: Option<User>,
    /// Currently selected mailbox
    pub selected: Option<SelectedMailbox>,
    /// Whether the connection has been upgraded with STARTTLS
    pub tls_active: bool,
    /// Session start time
    pub started_at: DateTime<Utc>,
    /// Last activity time
    pub last_activity: DateTime<Utc>,
}

impl ImapSession {
    /// Create a new session
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            state: SessionState::NotAuthenticated,
            user: None,
            selected: None,
            tls_active: false,
            started_at: now,
            last_activity: now,
        }
    }

    /// Check if session is authenticated
    pub fn is_authenticated(&self) -> bool {
        matches!(
            self.state,
            SessionState::Authenticated | SessionState::Selected | SessionState::ReadOnly
        )
    }

    /// Check if a mailbox is selected
    pub fn is_selected(&self) -> bool {
        matches!(self.state, SessionState::Selected | SessionState::ReadOnly)
    }

    /// Check if in read-only mode
    pub fn is_readonly(&self) -> bool {
        matches!(self.state, SessionState::ReadOnly)
    }

    /// Set authenticated state
    pub fn authenticate(&mut self, user: User) {
        self.user = Some(user);
        self.state = SessionState::Authenticated;
        self.update_activity();
    }

    /// Select a mailbox
    pub fn select(&mut self, mailbox: SelectedMailbox, readonly: bool) {
        self.selected = Some(mailbox);
        self.state = if readonly {
            SessionState::ReadOnly
        } else {
            SessionState::Selected
        };
        self.update_activity();
    }

    /// Close the selected mailbox
    pub fn close_mailbox(&mut self) {
        self.selected = None;
        if self.is_authenticated() {
            self.state = SessionState::Authenticated;
        }
        self.update_activity();
    }

    /// Set logout state
    pub fn logout(&mut self) {
        self.state = SessionState::Logout;
    }

    /// Update last activity timestamp
    pub fn update_activity(&mut self) {
        self.last_activity = Utc::now();
    }
}

impl Default for ImapSession {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mailgate_storage::{Inbox, MemoryStore};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn user() -> User {
        User {
            id: Uuid::new_v4(),
            username: "kermit".to_string(),
            email: "kermit@example.org".to_string(),
            password_hash: None,
            status: "active".to_string(),
            password_login: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn selected(uids: Vec<u32>) -> SelectedMailbox {
        let inbox = Inbox {
            id: Uuid::new_v4(),
            project_id: Uuid::new_v4(),
            email: "kermit@example.org".to_string(),
            created_at: None,
        };
        SelectedMailbox::new(Mailbox::new(inbox, Arc::new(MemoryStore::new())), uids)
    }

    #[test]
    fn test_session_new() {
        let session = ImapSession::new();
        assert_eq!(session.state, SessionState::NotAuthenticated);
        assert!(!session.is_authenticated());
        assert!(!session.is_selected());
    }

    #[test]
    fn test_session_authenticate() {
        let mut session = ImapSession::new();
        session.authenticate(user());
        assert_eq!(session.state, SessionState::Authenticated);
        assert!(session.is_authenticated());
        assert!(!session.is_selected());
    }

    #[test]
    fn test_session_select_and_examine() {
        let mut session = ImapSession::new();
        session.authenticate(user());

        session.select(selected(vec![1, 2]), false);
        assert_eq!(session.state, SessionState::Selected);
        assert!(!session.is_readonly());

        session.select(selected(vec![1, 2]), true);
        assert_eq!(session.state, SessionState::ReadOnly);
        assert!(session.is_selected());

        session.close_mailbox();
        assert_eq!(session.state, SessionState::Authenticated);
        assert!(session.selected.is_none());
    }

    #[test]
    fn test_sync_reports_adjusted_sequence_numbers() {
        let mut mailbox = selected(vec![10, 11, 12, 13]);
        // 11 and 13 gone, 14 arrived
        let expunged = mailbox.sync(vec![10, 12, 14]);
        assert_eq!(expunged, vec![2, 3]);
        assert_eq!(mailbox.exists(), 3);

        assert!(mailbox.sync(vec![10, 12, 14]).is_empty());
    }
}
