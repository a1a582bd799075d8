//! Message ingestion
//!
//! Turns a raw RFC 5322 message received over SMTP into stored messages.
//! Only the subject and the first text part are kept; the envelope sender
//! and recipient are stored as given.

use mailgate_common::{Error, Result};
use mailgate_storage::{Inbox, InboxRepository, MessageStore, NewMessage, StoredMessage};
use mail_parser::MessageParser;
use std::sync::Arc;
use tracing::{debug, info};

/// Fields extracted from a raw message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedMail {
    pub subject: String,
    pub body: String,
}

impl ParsedMail {
    /// Parse a raw message. Missing subject or text body become empty strings.
    pub fn parse(raw: &[u8]) -> Result<Self> {
        if raw.iter().all(u8::is_ascii_whitespace) {
            return Err(Error::Validation("Empty message".to_string()));
        }

        let message = MessageParser::default()
            .parse(raw)
            .ok_or_else(|| Error::Validation("Failed to parse message".to_string()))?;

        Ok(Self {
            subject: message.subject().unwrap_or_default().to_string(),
            body: message
                .body_text(0)
                .map(|body| body.into_owned())
                .unwrap_or_default(),
        })
    }
}

/// Stores incoming mail in recipient inboxes
pub struct Ingestor {
    inboxes: Arc<dyn InboxRepository>,
    messages: Arc<dyn MessageStore>,
}

impl Ingestor {
    pub fn new(inboxes: Arc<dyn InboxRepository>, messages: Arc<dyn MessageStore>) -> Self {
        Self { inboxes, messages }
    }

    /// Inbox that receives mail for `recipient`, including `local.tag@domain`
    /// forms of an inbox address
    pub async fn resolve_recipient(&self, recipient: &str) -> Result<Option<Inbox>> {
        self.inboxes.get_by_email_with_wildcard(recipient).await
    }

    /// Store one already parsed message in `inbox`
    pub async fn store(
        &self,
        inbox: &Inbox,
        sender: &str,
        recipient: &str,
        mail: &ParsedMail,
    ) -> Result<StoredMessage> {
        let stored = self
            .messages
            .create(NewMessage {
                inbox_id: inbox.id,
                sender: sender.to_string(),
                receiver: recipient.to_string(),
                subject: mail.subject.clone(),
                body: mail.body.clone(),
            })
            .await?;

        info!(
            inbox = %inbox.email,
            uid = stored.uid,
            sender = %sender,
            "Message delivered"
        );
        Ok(stored)
    }

    /// Parse `raw` and store it for `recipient`
    pub async fn deliver(&self, sender: &str, recipient: &str, raw: &[u8]) -> Result<StoredMessage> {
        let mail = ParsedMail::parse(raw)?;
        let inbox = match self.resolve_recipient(recipient).await? {
            Some(inbox) => inbox,
            None => {
                debug!(recipient = %recipient, "No inbox for recipient");
                return Err(Error::NotFound(format!("inbox for {}", recipient)));
            }
        };
        self.store(&inbox, sender, recipient, &mail).await
    }
}
