//! Mailbox engine errors

use thiserror::Error;

/// Errors surfaced by the mailbox engine and the account adapters
#[derive(Debug, Error)]
pub enum MailboxError {
    #[error("authentication failed")]
    AuthenticationFailure,

    #[error("account is not active")]
    AccountInactive,

    #[error("mailbox not found: {0}")]
    MailboxNotFound(String),

    #[error("{0} not supported")]
    Unsupported(&'static str),

    #[error("store error: {0}")]
    Store(#[from] mailgate_common::Error),
}

impl MailboxError {
    /// Response code carried in tagged NO responses
    pub fn response_code(&self) -> Option<&'static str> {
        match self {
            MailboxError::AuthenticationFailure => Some("AUTHENTICATIONFAILED"),
            MailboxError::AccountInactive => Some("AUTHORIZATIONFAILED"),
            MailboxError::MailboxNotFound(_) => Some("NONEXISTENT"),
            MailboxError::Unsupported(_) => Some("CANNOT"),
            MailboxError::Store(_) => Some("SERVERBUG"),
        }
    }
}
