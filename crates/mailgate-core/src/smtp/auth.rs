//! SMTP Authentication module
//!
//! Submission clients authenticate with their username and an API token,
//! using either the PLAIN or the LOGIN mechanism.

use crate::accounts::AccountService;
use crate::imap::MailboxError;
use crate::sasl::{self, SaslError};
use mailgate_storage::User;
use std::sync::Arc;
use tracing::{debug, warn};

/// Result of an AUTH exchange
#[derive(Debug, Clone)]
pub enum AuthOutcome {
    Success(User),
    InvalidCredentials,
    AccountDisabled,
    /// The account store could not be reached
    TemporaryFailure,
}

impl AuthOutcome {
    /// SMTP reply for the outcome
    pub fn reply(&self) -> (u16, &'static str) {
        match self {
            AuthOutcome::Success(_) => (235, "2.7.0 Authentication successful"),
            AuthOutcome::InvalidCredentials => (535, "5.7.8 Authentication credentials invalid"),
            AuthOutcome::AccountDisabled => (550, "5.7.1 Account disabled"),
            AuthOutcome::TemporaryFailure => (454, "4.7.0 Temporary authentication failure"),
        }
    }
}

/// SMTP Authenticator
pub struct SmtpAuthenticator {
    accounts: Arc<AccountService>,
}

impl SmtpAuthenticator {
    pub fn new(accounts: Arc<AccountService>) -> Self {
        Self { accounts }
    }

    /// Authenticate using PLAIN mechanism
    ///
    /// PLAIN format: base64(\0username\0token) or base64(authzid\0authcid\0token)
    pub async fn authenticate_plain(&self, response: &str) -> Result<AuthOutcome, SaslError> {
        let credentials = sasl::decode_plain(response)?;
        debug!(username = %credentials.username, "AUTH PLAIN: Attempting authentication");
        Ok(self.verify(&credentials.username, &credentials.secret).await)
    }

    /// Authenticate using LOGIN mechanism (after receiving both username and token)
    pub async fn authenticate_login(
        &self,
        username: &str,
        token: &str,
    ) -> Result<AuthOutcome, SaslError> {
        let username = sasl::decode_login_field(username)?;
        let token = sasl::decode_login_field(token)?;
        debug!(username = %username, "AUTH LOGIN: Attempting authentication");
        Ok(self.verify(&username, &token).await)
    }

    async fn verify(&self, username: &str, token: &str) -> AuthOutcome {
        match self.accounts.login_with_token(username, token).await {
            Ok(user) => AuthOutcome::Success(user),
            Err(MailboxError::AccountInactive) => AuthOutcome::AccountDisabled,
            Err(MailboxError::Store(e)) => {
                warn!(username = %username, error = %e, "AUTH: Account lookup failed");
                AuthOutcome::TemporaryFailure
            }
            Err(e) => {
                debug!(username = %username, error = %e, "AUTH: Rejected");
                AuthOutcome::InvalidCredentials
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::tests::{add_token, service};
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use mailgate_common::types::UserStatus;
    use mailgate_storage::MemoryStore;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_plain_and_login_mechanisms() {
        let store = Arc::new(MemoryStore::new());
        let user = store.add_user("kermit", None).unwrap();
        add_token(&store, user.id, "frog-token");
        let auth = SmtpAuthenticator::new(Arc::new(service(&store)));

        let plain = BASE64.encode(b"\0kermit\0frog-token");
        assert!(matches!(
            auth.authenticate_plain(&plain).await,
            Ok(AuthOutcome::Success(u)) if u.username == "kermit"
        ));

        let outcome = auth
            .authenticate_login(&BASE64.encode("kermit"), &BASE64.encode("wrong"))
            .await
            .unwrap();
        assert_eq!(outcome.reply().0, 535);

        assert_eq!(
            auth.authenticate_plain("!!!").await.unwrap_err(),
            SaslError::InvalidBase64
        );
    }

    #[tokio::test]
    async fn test_disabled_account() {
        let store = Arc::new(MemoryStore::new());
        let mut user = store.add_user("gonzo", None).unwrap();
        add_token(&store, user.id, "chicken");
        user.status = UserStatus::Inactive.to_string();
        store.insert_user(user).unwrap();
        let auth = SmtpAuthenticator::new(Arc::new(service(&store)));

        let outcome = auth
            .authenticate_plain(&BASE64.encode(b"\0gonzo\0chicken"))
            .await
            .unwrap();
        assert_eq!(outcome.reply(), (550, "5.7.1 Account disabled"));
    }
}
