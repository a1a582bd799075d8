//! IMAP Command definitions

use super::mailbox::FlagOperation;
use super::search::SearchPredicate;
use super::uid::SequenceSet;

/// IMAP command tag (client-provided identifier)
pub type Tag = String;

/// FETCH data items
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchItem {
    /// Message flags
    Flags,
    /// Internal date
    InternalDate,
    /// RFC822.SIZE
    Rfc822Size,
    /// Envelope structure
    Envelope,
    /// BODYSTRUCTURE
    BodyStructure,
    /// Plain BODY: the body text
    Body,
    /// RFC822: the whole message
    Rfc822,
    /// Body section, with optional `<start.len>` partial
    BodySection {
        section: String,
        partial: Option<(u32, u32)>,
    },
    /// BODY.PEEK section
    BodyPeek {
        section: String,
        partial: Option<(u32, u32)>,
    },
    /// UID
    Uid,
    /// FLAGS INTERNALDATE RFC822.SIZE ENVELOPE
    All,
    /// FLAGS INTERNALDATE RFC822.SIZE
    Fast,
    /// ALL plus BODYSTRUCTURE
    Full,
}

impl FetchItem {
    /// Parse a single fetch item
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim().to_uppercase();
        match s.as_str() {
            "FLAGS" => Some(FetchItem::Flags),
            "INTERNALDATE" => Some(FetchItem::InternalDate),
            "RFC822.SIZE" => Some(FetchItem::Rfc822Size),
            "RFC822" => Some(FetchItem::Rfc822),
            "ENVELOPE" => Some(FetchItem::Envelope),
            "BODYSTRUCTURE" => Some(FetchItem::BodyStructure),
            "BODY" => Some(FetchItem::Body),
            "UID" => Some(FetchItem::Uid),
            "ALL" => Some(FetchItem::All),
            "FAST" => Some(FetchItem::Fast),
            "FULL" => Some(FetchItem::Full),
            _ if s.starts_with("BODY.PEEK[") => {
                let (section, partial) = Self::parse_section(s.strip_prefix("BODY.PEEK[")?)?;
                Some(FetchItem::BodyPeek { section, partial })
            }
            _ if s.starts_with("BODY[") => {
                let (section, partial) = Self::parse_section(s.strip_prefix("BODY[")?)?;
                Some(FetchItem::BodySection { section, partial })
            }
            _ => None,
        }
    }

    /// `SECTION]` or `SECTION]<start.len>`
    fn parse_section(rest: &str) -> Option<(String, Option<(u32, u32)>)> {
        let (section, tail) = rest.split_once(']')?;
        let partial = if tail.is_empty() {
            None
        } else {
            let range = tail.strip_prefix('<')?.strip_suffix('>')?;
            let (start, len) = range.split_once('.')?;
            Some((start.parse().ok()?, len.parse().ok()?))
        };
        Some((section.to_string(), partial))
    }

    /// Parse fetch items from a parenthesized list or single item. Returns
    /// `None` if any item is unknown.
    pub fn parse_list(s: &str) -> Option<Vec<Self>> {
        let s = s.trim();

        // Single item
        if !s.starts_with('(') {
            return Self::parse(s).map(|item| vec![item]);
        }

        // List in parentheses
        let content = s.strip_prefix('(').and_then(|s| s.strip_suffix(')'))?;

        // Split by whitespace, being careful about brackets
        let mut items = Vec::new();
        let mut current = String::new();
        let mut bracket_depth = 0usize;

        for c in content.chars() {
            match c {
                '[' => {
                    bracket_depth += 1;
                    current.push(c);
                }
                ']' => {
                    bracket_depth = bracket_depth.saturating_sub(1);
                    current.push(c);
                }
                ' ' if bracket_depth == 0 => {
                    if !current.is_empty() {
                        items.push(Self::parse(&current)?);
                        current.clear();
                    }
                }
                _ => current.push(c),
            }
        }

        if !current.is_empty() {
            items.push(Self::parse(&current)?);
        }

        (!items.is_empty()).then_some(items)
    }
}

/// Store flags specification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreFlags {
    pub operation: FlagOperation,
    pub silent: bool,
    /// Flag names as sent; unknown names are ignored when applied
    pub flags: Vec<String>,
}

/// IMAP Command
#[derive(Debug, Clone)]
pub enum ImapCommand {
    // Any state commands
    Capability,
    Noop,
    Logout,
    StartTls,

    // Not authenticated state
    Login {
        username: String,
        password: String,
    },
    Authenticate {
        mechanism: String,
        initial_response: Option<String>,
    },

    // Authenticated state
    Select {
        mailbox: String,
    },
    Examine {
        mailbox: String,
    },
    Create {
        mailbox: String,
    },
    Delete {
        mailbox: String,
    },
    Rename {
        old_mailbox: String,
        new_mailbox: String,
    },
    Subscribe {
        mailbox: String,
    },
    Unsubscribe {
        mailbox: String,
    },
    List {
        reference: String,
        pattern: String,
    },
    Lsub {
        reference: String,
        pattern: String,
    },
    Status {
        mailbox: String,
        items: Vec<String>,
    },
    Append {
        mailbox: String,
    },
    Namespace,

    // Selected state
    Close,
    Check,
    Fetch {
        sequence: SequenceSet,
        items: Vec<FetchItem>,
        uid: bool,
    },
    Search {
        predicate: SearchPredicate,
        uid: bool,
    },
    Store {
        sequence: SequenceSet,
        flags: StoreFlags,
        uid: bool,
    },
    Copy {
        sequence: SequenceSet,
        mailbox: String,
        uid: bool,
    },
    Move {
        sequence: SequenceSet,
        mailbox: String,
        uid: bool,
    },
    /// EXPUNGE, or UID EXPUNGE with a UID set
    Expunge {
        uids: Option<SequenceSet>,
    },

    // Unknown command
    Unknown {
        command: String,
    },
}

/// Parsed IMAP command with tag
#[derive(Debug, Clone)]
pub struct TaggedCommand {
    pub tag: Tag,
    pub command: ImapCommand,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_fetch_item_parse() {
        assert_eq!(FetchItem::parse("FLAGS"), Some(FetchItem::Flags));
        assert_eq!(FetchItem::parse("uid"), Some(FetchItem::Uid));
        assert_eq!(FetchItem::parse("ALL"), Some(FetchItem::All));
        assert_eq!(FetchItem::parse("RFC822"), Some(FetchItem::Rfc822));
        assert_eq!(FetchItem::parse("X-GM-LABELS"), None);
    }

    #[test]
    fn test_fetch_item_sections() {
        assert_eq!(
            FetchItem::parse("BODY.PEEK[HEADER]"),
            Some(FetchItem::BodyPeek {
                section: "HEADER".into(),
                partial: None
            })
        );
        assert_eq!(
            FetchItem::parse("BODY[]<0.2048>"),
            Some(FetchItem::BodySection {
                section: String::new(),
                partial: Some((0, 2048))
            })
        );
        assert_eq!(FetchItem::parse("BODY[]<x.1>"), None);
    }

    #[test]
    fn test_fetch_item_list() {
        let items = FetchItem::parse_list("(FLAGS UID RFC822.SIZE)").unwrap();
        assert_eq!(
            items,
            vec![FetchItem::Flags, FetchItem::Uid, FetchItem::Rfc822Size]
        );

        let items =
            FetchItem::parse_list("(UID BODY.PEEK[HEADER.FIELDS (FROM TO)])").unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(
            items[1],
            FetchItem::BodyPeek {
                section: "HEADER.FIELDS (FROM TO)".into(),
                partial: None
            }
        );

        assert!(FetchItem::parse_list("(FLAGS BOGUS)").is_none());
        assert!(FetchItem::parse_list("()").is_none());
    }
}
