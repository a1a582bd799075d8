//! Account authentication shared by the IMAP and submission listeners

use crate::imap::MailboxError;
use crate::token_cache::TokenCache;
use argon2::{Argon2, PasswordHash, PasswordVerifier};
use mailgate_storage::{User, UserRepository};
use std::sync::Arc;
use tracing::{debug, warn};

/// Resolves credentials to active users
pub struct AccountService {
    users: Arc<dyn UserRepository>,
    tokens: Arc<TokenCache>,
}

impl AccountService {
    pub fn new(users: Arc<dyn UserRepository>, tokens: Arc<TokenCache>) -> Self {
        Self { users, tokens }
    }

    async fn active_user(&self, username: &str) -> Result<User, MailboxError> {
        let user = match self.users.get_by_username(username).await? {
            Some(user) => user,
            None => {
                debug!(username = %username, "AUTH: User not found");
                return Err(MailboxError::AuthenticationFailure);
            }
        };

        if !user.is_active() {
            debug!(username = %username, status = %user.status, "AUTH: User is inactive");
            return Err(MailboxError::AccountInactive);
        }

        Ok(user)
    }

    /// Username and password, checked against the stored argon2 hash
    pub async fn login_with_password(
        &self,
        username: &str,
        password: &str,
    ) -> Result<User, MailboxError> {
        let user = self.active_user(username).await?;

        if !user.password_login {
            debug!(username = %username, "AUTH: Password login disabled");
            return Err(MailboxError::AuthenticationFailure);
        }

        let Some(hash) = user.password_hash.as_deref() else {
            debug!(username = %username, "AUTH: No password set");
            return Err(MailboxError::AuthenticationFailure);
        };

        if verify_password(password, hash) {
            debug!(username = %username, "AUTH: Password login successful");
            Ok(user)
        } else {
            debug!(username = %username, "AUTH: Invalid password");
            Err(MailboxError::AuthenticationFailure)
        }
    }

    /// Username and API token; the token must belong to the user
    pub async fn login_with_token(
        &self,
        username: &str,
        secret: &str,
    ) -> Result<User, MailboxError> {
        let user = self.active_user(username).await?;

        let token = match self.tokens.lookup(secret).await? {
            Some(token) if token.user_id == user.id => token,
            Some(_) => {
                warn!(username = %username, "AUTH: Token belongs to another user");
                return Err(MailboxError::AuthenticationFailure);
            }
            None => {
                debug!(username = %username, "AUTH: Unknown or expired token");
                return Err(MailboxError::AuthenticationFailure);
            }
        };

        self.tokens.touch(&token);
        debug!(username = %username, token = %token.name, "AUTH: Token login successful");
        Ok(user)
    }
}

/// Verify a password against a PHC-format argon2 hash
fn verify_password(password: &str, hash: &str) -> bool {
    let parsed_hash = match PasswordHash::new(hash) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!(error = %e, "AUTH: Invalid password hash format");
            return false;
        }
    };

    match Argon2::default().verify_password(password.as_bytes(), &parsed_hash) {
        Ok(()) => true,
        Err(argon2::password_hash::Error::Password) => false,
        Err(e) => {
            warn!(error = %e, "AUTH: Password verification error");
            false
        }
    }
}
