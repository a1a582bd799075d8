//! Listener roles
//!
//! The relay and submission listeners share one session state machine and
//! differ only in the decisions made here.

use mailgate_common::types::EmailAddress;

/// SMTP reply used to turn a command down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rejection {
    pub code: u16,
    pub message: &'static str,
}

impl Rejection {
    pub const fn new(code: u16, message: &'static str) -> Self {
        Self { code, message }
    }
}

/// Decisions that depend on the listener a session arrived on
pub trait DeliveryPolicy: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &'static str;

    /// Whether AUTH is offered at all
    fn offers_auth(&self) -> bool;

    /// Whether MAIL is refused until the client has authenticated
    fn requires_auth(&self) -> bool;

    /// Check a recipient before its inbox is looked up
    fn check_recipient(&self, recipient: &EmailAddress) -> Result<(), Rejection>;
}

/// Port 25: unauthenticated delivery to the local mail domain only
#[derive(Debug, Clone)]
pub struct RelayPolicy {
    email_domain: String,
}

impl RelayPolicy {
    pub fn new(email_domain: impl Into<String>) -> Self {
        Self {
            email_domain: email_domain.into(),
        }
    }
}

impl DeliveryPolicy for RelayPolicy {
    fn name(&self) -> &'static str {
        "SMTP"
    }

    fn offers_auth(&self) -> bool {
        false
    }

    fn requires_auth(&self) -> bool {
        false
    }

    fn check_recipient(&self, recipient: &EmailAddress) -> Result<(), Rejection> {
        if recipient.is_in_domain(&self.email_domain) {
            Ok(())
        } else {
            Err(Rejection::new(550, "5.7.1 Relay not permitted"))
        }
    }
}

/// Port 587: authenticated clients with an API token
#[derive(Debug, Clone, Default)]
pub struct SubmissionPolicy;

impl DeliveryPolicy for SubmissionPolicy {
    fn name(&self) -> &'static str {
        "Submission"
    }

    fn offers_auth(&self) -> bool {
        true
    }

    fn requires_auth(&self) -> bool {
        true
    }

    fn check_recipient(&self, _recipient: &EmailAddress) -> Result<(), Rejection> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_relay_only_accepts_local_domain() {
        let policy = RelayPolicy::new("example.org");
        assert!(policy
            .check_recipient(&EmailAddress::new("kermit", "Example.ORG"))
            .is_ok());
        assert_eq!(
            policy.check_recipient(&EmailAddress::new("kermit", "elsewhere.net")),
            Err(Rejection::new(550, "5.7.1 Relay not permitted"))
        );
        assert!(!policy.offers_auth());
    }

    #[test]
    fn test_submission_requires_auth() {
        let policy = SubmissionPolicy;
        assert!(policy.offers_auth());
        assert!(policy.requires_auth());
        assert!(policy
            .check_recipient(&EmailAddress::new("anyone", "anywhere.net"))
            .is_ok());
    }
}
