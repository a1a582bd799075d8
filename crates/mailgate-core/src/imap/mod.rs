//! IMAP4 Server Module
//!
//! Implements an IMAP4rev1 server over the message store. Every inbox the
//! user can reach through a project is one mailbox, named by its address;
//! `INBOX` aliases the first of them.
//!
//! Supported commands:
//! - CAPABILITY, NOOP, LOGOUT, STARTTLS
//! - LOGIN, AUTHENTICATE (PLAIN)
//! - LIST, LSUB, SELECT, EXAMINE, STATUS, NAMESPACE
//! - FETCH, SEARCH, STORE, EXPUNGE (plain and UID forms)
//! - CLOSE, CHECK
//!
//! CREATE, DELETE, RENAME, SUBSCRIBE, UNSUBSCRIBE, APPEND, COPY and MOVE are
//! recognised and answered with `NO [CANNOT]`.

pub mod backend;
pub mod command;
pub mod error;
pub mod mailbox;
pub mod parser;
pub mod projector;
pub mod response;
pub mod search;
pub mod server;
pub mod session;
pub mod uid;

pub use backend::ImapBackend;
pub use error::MailboxError;
pub use mailbox::{FetchedMessage, Flag, FlagOperation, Mailbox, MailboxStatus};
pub use search::SearchPredicate;
pub use server::ImapServer;
pub use uid::{AddressingMode, SequenceSet};
