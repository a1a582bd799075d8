//! Mailgate Core - mailbox protocol engine and mail listeners
//!
//! This crate provides the IMAP mailbox engine over the message store, the
//! SMTP relay and submission listeners, message ingestion and the account
//! services shared by the listeners.

pub mod accounts;
pub mod delivery;
pub mod imap;
pub mod sasl;
pub mod smtp;
pub mod tls;
pub mod token_cache;

pub use accounts::AccountService;
pub use delivery::{Ingestor, ParsedMail};
pub use imap::{ImapBackend, ImapServer, MailboxError};
pub use smtp::{SmtpContext, SmtpServer};
pub use token_cache::TokenCache;
