//! IMAP Response generation
//!
//! Generates IMAP4 response strings for client communication.

use super::error::MailboxError;
use super::mailbox::Flag;
use super::projector::{BodyStructure, Envelope, FetchValue};
use chrono::{DateTime, Utc};
use mailgate_common::Address;

/// Base capabilities; STARTTLS and LOGINDISABLED depend on the connection
const CAPABILITIES: &str = "IMAP4rev1 SASL-IR AUTH=PLAIN NAMESPACE UIDPLUS";

/// Hierarchy delimiter announced in LIST; no mailbox has children
pub const DELIMITER: &str = "/";

/// IMAP Response builder
pub struct ImapResponse;

impl ImapResponse {
    /// Capability atoms for the current connection state
    pub fn capabilities(starttls: bool, login_disabled: bool) -> String {
        let mut caps = CAPABILITIES.to_string();
        if starttls {
            caps.push_str(" STARTTLS");
        }
        if login_disabled {
            caps.push_str(" LOGINDISABLED");
        }
        caps
    }

    /// Server greeting
    pub fn greeting(hostname: &str, capabilities: &str) -> String {
        format!(
            "* OK [CAPABILITY {}] {} Mailgate IMAP server ready\r\n",
            capabilities, hostname
        )
    }

    /// Tagged OK response
    pub fn ok(tag: &str, message: &str) -> String {
        format!("{} OK {}\r\n", tag, message)
    }

    /// Tagged NO response
    pub fn no(tag: &str, message: &str) -> String {
        format!("{} NO {}\r\n", tag, message)
    }

    /// Tagged NO response with a response code
    pub fn no_with_code(tag: &str, code: &str, message: &str) -> String {
        format!("{} NO [{}] {}\r\n", tag, code, message)
    }

    /// Tagged NO for an engine error. Store failures are not described to
    /// the client.
    pub fn error(tag: &str, error: &MailboxError) -> String {
        let message = match error {
            MailboxError::Store(_) => "Internal server error".to_string(),
            other => other.to_string(),
        };
        match error.response_code() {
            Some(code) => Self::no_with_code(tag, code, &message),
            None => Self::no(tag, &message),
        }
    }

    /// Tagged BAD response
    pub fn bad(tag: &str, message: &str) -> String {
        format!("{} BAD {}\r\n", tag, message)
    }

    /// Untagged BYE response
    pub fn bye(message: &str) -> String {
        format!("* BYE {}\r\n", message)
    }

    /// CAPABILITY response
    pub fn capability(capabilities: &str) -> String {
        format!("* CAPABILITY {}\r\n", capabilities)
    }

    /// EXPUNGE response
    pub fn expunge(seq: u32) -> String {
        format!("* {} EXPUNGE\r\n", seq)
    }

    /// NAMESPACE response
    pub fn namespace() -> String {
        // Personal namespace, Other users namespace, Shared namespace
        format!("* NAMESPACE ((\"\" \"{}\")) NIL NIL\r\n", DELIMITER)
    }

    /// LIST response for a mailbox
    pub fn list(flags: &[&str], mailbox: &str) -> String {
        format!(
            "* LIST ({}) \"{}\" {}\r\n",
            flags.join(" "),
            DELIMITER,
            Self::quoted(mailbox)
        )
    }

    /// LSUB response for a mailbox
    pub fn lsub(flags: &[&str], mailbox: &str) -> String {
        format!(
            "* LSUB ({}) \"{}\" {}\r\n",
            flags.join(" "),
            DELIMITER,
            Self::quoted(mailbox)
        )
    }

    /// SELECT/EXAMINE response components
    pub fn mailbox_flags(flags: &[Flag]) -> String {
        format!("* FLAGS ({})\r\n", Self::flag_list(flags))
    }

    pub fn permanent_flags(flags: &[Flag]) -> String {
        format!(
            "* OK [PERMANENTFLAGS ({})] Flags permitted\r\n",
            Self::flag_list(flags)
        )
    }

    pub fn exists(count: u32) -> String {
        format!("* {} EXISTS\r\n", count)
    }

    pub fn recent(count: u32) -> String {
        format!("* {} RECENT\r\n", count)
    }

    pub fn uid_validity(validity: u32) -> String {
        format!("* OK [UIDVALIDITY {}] UIDs valid\r\n", validity)
    }

    pub fn uid_next(next: u32) -> String {
        format!("* OK [UIDNEXT {}] Predicted next UID\r\n", next)
    }

    /// STATUS response
    pub fn status(mailbox: &str, items: &[(&str, u32)]) -> String {
        let items_str: Vec<String> = items.iter().map(|(k, v)| format!("{} {}", k, v)).collect();
        format!(
            "* STATUS {} ({})\r\n",
            Self::quoted(mailbox),
            items_str.join(" ")
        )
    }

    /// FETCH response for one message
    pub fn fetch(seq: u32, values: &[FetchValue]) -> String {
        let items: Vec<String> = values.iter().map(Self::format_fetch_value).collect();
        format!("* {} FETCH ({})\r\n", seq, items.join(" "))
    }

    /// SEARCH response
    pub fn search(ids: &[u32]) -> String {
        if ids.is_empty() {
            "* SEARCH\r\n".to_string()
        } else {
            let ids_str: Vec<String> = ids.iter().map(|u| u.to_string()).collect();
            format!("* SEARCH {}\r\n", ids_str.join(" "))
        }
    }

    /// Continue response for AUTHENTICATE
    pub fn continue_req() -> String {
        "+ \r\n".to_string()
    }

    fn format_fetch_value(value: &FetchValue) -> String {
        match value {
            FetchValue::Flags(flags) => format!("FLAGS ({})", Self::flag_list(flags)),
            FetchValue::Uid(uid) => format!("UID {}", uid),
            FetchValue::InternalDate(date) => {
                format!("INTERNALDATE {}", Self::format_internal_date(date))
            }
            FetchValue::Rfc822Size(size) => format!("RFC822.SIZE {}", size),
            FetchValue::Envelope(envelope) => {
                format!("ENVELOPE {}", Self::format_envelope(envelope))
            }
            FetchValue::BodyStructure(structure) => {
                format!("BODYSTRUCTURE {}", Self::format_body_structure(structure))
            }
            FetchValue::Body(text) => format!("BODY[TEXT] {}", Self::literal(text)),
            FetchValue::Section {
                label,
                origin,
                content,
            } => match origin {
                Some(origin) => format!("{}<{}> {}", label, origin, Self::literal(content)),
                None => format!("{} {}", label, Self::literal(content)),
            },
        }
    }

    fn flag_list(flags: &[Flag]) -> String {
        flags
            .iter()
            .map(|flag| flag.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Format internal date for FETCH
    pub fn format_internal_date(dt: &DateTime<Utc>) -> String {
        format!("\"{}\"", dt.format("%d-%b-%Y %H:%M:%S %z"))
    }

    /// Format envelope for FETCH:
    /// (date subject from sender reply-to to cc bcc in-reply-to message-id)
    pub fn format_envelope(envelope: &Envelope) -> String {
        let date = envelope.date.format("%a, %d %b %Y %H:%M:%S %z").to_string();
        let from = Self::format_address_list(&envelope.from);
        format!(
            "({} {} {} {} {} {} NIL NIL NIL NIL)",
            Self::quoted(&date),
            Self::nstring(&envelope.subject),
            from,
            Self::format_address_list(&envelope.sender),
            from, // reply-to = from
            Self::format_address_list(&envelope.to),
        )
    }

    /// Format address list for envelope
    fn format_address_list(addresses: &[Address]) -> String {
        if addresses.is_empty() {
            return "NIL".to_string();
        }
        let formatted: Vec<String> = addresses
            .iter()
            .map(|address| {
                let name = address
                    .display_name
                    .as_deref()
                    .map(Self::string)
                    .unwrap_or_else(|| "NIL".to_string());
                format!(
                    "({} NIL {} {})",
                    name,
                    Self::string(&address.local_part),
                    Self::string(&address.domain)
                )
            })
            .collect();
        format!("({})", formatted.join(""))
    }

    /// Format BODYSTRUCTURE for a single text/plain part
    pub fn format_body_structure(structure: &BodyStructure) -> String {
        format!(
            "(\"TEXT\" \"PLAIN\" (\"CHARSET\" \"UTF-8\") NIL NIL \"8BIT\" {} {} NIL NIL NIL NIL)",
            structure.size, structure.lines
        )
    }

    /// Quoted string, or a literal when quoting cannot carry the value
    fn string(s: &str) -> String {
        if s.contains(['\r', '\n', '\0']) {
            Self::literal(s)
        } else {
            Self::quoted(s)
        }
    }

    /// Like [`string`](Self::string), but NIL for an empty value
    fn nstring(s: &str) -> String {
        if s.is_empty() {
            "NIL".to_string()
        } else {
            Self::string(s)
        }
    }

    /// Quote a string for IMAP (escape backslash and quote)
    fn quoted(s: &str) -> String {
        format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
    }

    fn literal(s: &str) -> String {
        format!("{{{}}}\r\n{}", s.len(), s)
    }
}
