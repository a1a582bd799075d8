//! Account and mailbox resolution for IMAP sessions

use super::error::MailboxError;
use super::mailbox::Mailbox;
use crate::accounts::AccountService;
use mailgate_storage::{InboxRepository, MessageStore, User};
use std::sync::Arc;
use tracing::debug;

/// Name that always resolves to the user's first inbox
pub const INBOX_ALIAS: &str = "INBOX";

/// Backend behind an IMAP session: login plus the mailbox namespace of one
/// user. Mailboxes are the inboxes of the projects the user belongs to and
/// cannot be created, removed or renamed through the protocol.
pub struct ImapBackend {
    accounts: Arc<AccountService>,
    inboxes: Arc<dyn InboxRepository>,
    messages: Arc<dyn MessageStore>,
}

impl ImapBackend {
    pub fn new(
        accounts: Arc<AccountService>,
        inboxes: Arc<dyn InboxRepository>,
        messages: Arc<dyn MessageStore>,
    ) -> Self {
        Self {
            accounts,
            inboxes,
            messages,
        }
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<User, MailboxError> {
        self.accounts.login_with_password(username, password).await
    }

    /// `INBOX` followed by the address of every inbox the user can access
    pub async fn list_mailboxes(&self, user: &User) -> Result<Vec<String>, MailboxError> {
        let inboxes = self.inboxes.list_by_user(user.id).await?;
        let mut names = Vec::with_capacity(inboxes.len() + 1);
        names.push(INBOX_ALIAS.to_string());
        names.extend(inboxes.into_iter().map(|inbox| inbox.email));
        Ok(names)
    }

    /// Resolve a mailbox name for the user
    pub async fn get_mailbox(&self, user: &User, name: &str) -> Result<Mailbox, MailboxError> {
        let inbox = if name.eq_ignore_ascii_case(INBOX_ALIAS) {
            self.inboxes.list_by_user(user.id).await?.into_iter().next()
        } else {
            self.inboxes.get_by_email_for_user(name, user.id).await?
        };

        match inbox {
            Some(inbox) => Ok(Mailbox::new(inbox, self.messages.clone())),
            None => {
                debug!(user = %user.username, mailbox = %name, "Mailbox not found");
                Err(MailboxError::MailboxNotFound(name.to_string()))
            }
        }
    }

    pub async fn create_mailbox(&self, _name: &str) -> Result<(), MailboxError> {
        Err(MailboxError::Unsupported("CREATE"))
    }

    pub async fn delete_mailbox(&self, _name: &str) -> Result<(), MailboxError> {
        Err(MailboxError::Unsupported("DELETE"))
    }

    pub async fn rename_mailbox(&self, _from: &str, _to: &str) -> Result<(), MailboxError> {
        Err(MailboxError::Unsupported("RENAME"))
    }

    pub async fn subscribe(&self, _name: &str) -> Result<(), MailboxError> {
        Err(MailboxError::Unsupported("SUBSCRIBE"))
    }

    pub async fn unsubscribe(&self, _name: &str) -> Result<(), MailboxError> {
        Err(MailboxError::Unsupported("UNSUBSCRIBE"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::tests::service;
    use mailgate_storage::MemoryStore;
    use pretty_assertions::assert_eq;
    use uuid::Uuid;

    fn backend(store: &Arc<MemoryStore>) -> ImapBackend {
        ImapBackend::new(Arc::new(service(store)), store.clone(), store.clone())
    }

    #[tokio::test]
    async fn test_inbox_alias_and_listing() {
        let store = Arc::new(MemoryStore::new());
        let user = store.add_user("kermit", None).unwrap();
        let project = Uuid::new_v4();
        store.add_project_member(project, user.id).unwrap();
        store.add_inbox(project, "first@example.org").unwrap();
        store.add_inbox(project, "second@example.org").unwrap();
        store
            .add_inbox(Uuid::new_v4(), "stranger@example.org")
            .unwrap();
        let backend = backend(&store);

        assert_eq!(
            backend.list_mailboxes(&user).await.unwrap(),
            vec!["INBOX", "first@example.org", "second@example.org"]
        );

        let inbox = backend.get_mailbox(&user, "inbox").await.unwrap();
        assert_eq!(inbox.name(), "first@example.org");

        let second = backend
            .get_mailbox(&user, "second@example.org")
            .await
            .unwrap();
        assert_eq!(second.name(), "second@example.org");

        assert!(matches!(
            backend.get_mailbox(&user, "stranger@example.org").await,
            Err(MailboxError::MailboxNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_inbox_alias_without_inboxes() {
        let store = Arc::new(MemoryStore::new());
        let user = store.add_user("kermit", None).unwrap();
        let backend = backend(&store);

        assert!(matches!(
            backend.get_mailbox(&user, "INBOX").await,
            Err(MailboxError::MailboxNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_namespace_changes_are_rejected() {
        let store = Arc::new(MemoryStore::new());
        let backend = backend(&store);

        assert!(matches!(
            backend.create_mailbox("x").await,
            Err(MailboxError::Unsupported("CREATE"))
        ));
        assert!(matches!(
            backend.rename_mailbox("x", "y").await,
            Err(MailboxError::Unsupported("RENAME"))
        ));
        assert!(matches!(
            backend.subscribe("x").await,
            Err(MailboxError::Unsupported("SUBSCRIBE"))
        ));
    }
}
