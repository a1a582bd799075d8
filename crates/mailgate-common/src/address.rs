//! Free-text email address parsing
//!
//! Stored senders and receivers are whatever the submitting client put on
//! the envelope, so they are not guaranteed to be valid RFC 5322. The parser
//! first tries the `Display Name <local@domain>` form and falls back to a
//! plain split on `@`.

use thiserror::Error;

/// Reason an address string could not be parsed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("invalid email format: empty address")]
    Empty,

    #[error("invalid email format: missing '@' in {0:?}")]
    MissingAt(String),

    #[error("invalid email format: multiple '@' in {0:?}")]
    MultipleAt(String),

    #[error("invalid email format: empty local part or domain in {0:?}")]
    EmptyPart(String),
}

/// Structured email address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    /// Display name, without surrounding quotes
    pub display_name: Option<String>,
    /// Mailbox (local) part
    pub local_part: String,
    /// Domain part
    pub domain: String,
}

impl Address {
    /// Parse a free-text address
    pub fn parse(input: &str) -> Result<Self, AddressError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(AddressError::Empty);
        }

        match Self::parse_structured(trimmed) {
            Ok(address) => Ok(address),
            Err(structured_err) => {
                Self::split_addr_spec(trimmed, None).map_err(|_| structured_err)
            }
        }
    }

    fn parse_structured(input: &str) -> Result<Self, AddressError> {
        let angle = input
            .strip_suffix('>')
            .and_then(|rest| rest.rfind('<').map(|lt| (&rest[..lt], &rest[lt + 1..])));

        match angle {
            Some((name, spec)) => {
                let name = unquote(name.trim());
                let name = (!name.is_empty()).then_some(name);
                Self::split_addr_spec(spec.trim(), name)
            }
            None => Self::split_addr_spec(input, None),
        }
    }

    fn split_addr_spec(spec: &str, display_name: Option<String>) -> Result<Self, AddressError> {
        let mut parts = spec.split('@');
        let (local, domain) = match (parts.next(), parts.next(), parts.next()) {
            (Some(local), Some(domain), None) => (local, domain),
            (_, None, _) => return Err(AddressError::MissingAt(spec.to_string())),
            _ => return Err(AddressError::MultipleAt(spec.to_string())),
        };

        if local.is_empty() || domain.is_empty() {
            return Err(AddressError::EmptyPart(spec.to_string()));
        }

        Ok(Self {
            display_name,
            local_part: local.to_string(),
            domain: domain.to_string(),
        })
    }
}

/// Strip one level of double quotes and resolve backslash escapes
fn unquote(name: &str) -> String {
    let inner = match name.strip_prefix('"').and_then(|n| n.strip_suffix('"')) {
        Some(inner) => inner,
        None => return name.to_string(),
    };

    let mut out = String::with_capacity(inner.len());
    let mut escaped = false;
    for c in inner.chars() {
        if escaped {
            out.push(c);
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else {
            out.push(c);
        }
    }
    out
}
