//! IMAP Command Parser
//!
//! Parses one command line at a time. Literals are not supported, so every
//! argument has to be an atom or a quoted string.

use super::command::{FetchItem, ImapCommand, StoreFlags, TaggedCommand};
use super::mailbox::{Flag, FlagOperation};
use super::search::{HeaderField, SearchPredicate};
use super::uid::SequenceSet;
use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};

/// IMAP command parser
pub struct ImapParser;

impl ImapParser {
    /// Parse an IMAP command line
    pub fn parse(line: &str) -> Option<TaggedCommand> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        let (tag, rest) = match line.split_once(' ') {
            Some((tag, rest)) => (tag, rest.trim()),
            None => (line, ""),
        };

        let command = Self::parse_command(rest)?;

        Some(TaggedCommand {
            tag: tag.to_string(),
            command,
        })
    }

    /// Tag of a line that failed to parse, for the BAD response
    pub fn tag_of(line: &str) -> Option<&str> {
        let line = line.trim();
        let tag = line.split(' ').next()?;
        (!tag.is_empty() && line.contains(' ')).then_some(tag)
    }

    /// Parse the command portion
    fn parse_command(input: &str) -> Option<ImapCommand> {
        let (name, args) = input.split_once(' ').unwrap_or((input, ""));
        let cmd_name = name.to_uppercase();
        let args = args.trim();

        match cmd_name.as_str() {
            // Any state
            "CAPABILITY" => Some(ImapCommand::Capability),
            "NOOP" => Some(ImapCommand::Noop),
            "LOGOUT" => Some(ImapCommand::Logout),
            "STARTTLS" => Some(ImapCommand::StartTls),

            // Not authenticated
            "LOGIN" => Self::parse_login(args),
            "AUTHENTICATE" => Self::parse_authenticate(args),

            // Authenticated state
            "SELECT" => Some(ImapCommand::Select {
                mailbox: Self::parse_mailbox(args)?,
            }),
            "EXAMINE" => Some(ImapCommand::Examine {
                mailbox: Self::parse_mailbox(args)?,
            }),
            "CREATE" => Some(ImapCommand::Create {
                mailbox: Self::parse_mailbox(args)?,
            }),
            "DELETE" => Some(ImapCommand::Delete {
                mailbox: Self::parse_mailbox(args)?,
            }),
            "RENAME" => Self::parse_rename(args),
            "SUBSCRIBE" => Some(ImapCommand::Subscribe {
                mailbox: Self::parse_mailbox(args)?,
            }),
            "UNSUBSCRIBE" => Some(ImapCommand::Unsubscribe {
                mailbox: Self::parse_mailbox(args)?,
            }),
            "LIST" => {
                let (reference, pattern) = Self::parse_two_astrings(args)?;
                Some(ImapCommand::List { reference, pattern })
            }
            "LSUB" => {
                let (reference, pattern) = Self::parse_two_astrings(args)?;
                Some(ImapCommand::Lsub { reference, pattern })
            }
            "STATUS" => Self::parse_status(args),
            "APPEND" => Some(ImapCommand::Append {
                mailbox: Self::parse_astring(args)?.0,
            }),
            "NAMESPACE" => Some(ImapCommand::Namespace),

            // Selected state
            "CLOSE" => Some(ImapCommand::Close),
            "CHECK" => Some(ImapCommand::Check),
            "FETCH" => Self::parse_fetch(args, false),
            "SEARCH" => Self::parse_search(args, false),
            "STORE" => Self::parse_store(args, false),
            "COPY" => Self::parse_copy(args, false),
            "MOVE" => Self::parse_move(args, false),
            "EXPUNGE" => Some(ImapCommand::Expunge { uids: None }),
            "UID" => Self::parse_uid_command(args),

            _ => Some(ImapCommand::Unknown { command: cmd_name }),
        }
    }

    /// Parse LOGIN command arguments
    fn parse_login(args: &str) -> Option<ImapCommand> {
        let (username, password) = Self::parse_two_astrings(args)?;
        Some(ImapCommand::Login { username, password })
    }

    /// Parse AUTHENTICATE command
    fn parse_authenticate(args: &str) -> Option<ImapCommand> {
        let mut parts = args.split_whitespace();
        let mechanism = parts.next()?.to_uppercase();
        let initial_response = parts.next().map(|s| s.to_string());
        Some(ImapCommand::Authenticate {
            mechanism,
            initial_response,
        })
    }

    /// Parse STATUS command
    fn parse_status(args: &str) -> Option<ImapCommand> {
        // STATUS mailbox (item1 item2 ...)
        let (mailbox, rest) = Self::parse_astring(args)?;
        let content = rest.trim().strip_prefix('(')?.strip_suffix(')')?;
        let items = content
            .split_whitespace()
            .map(|s| s.to_uppercase())
            .collect();

        Some(ImapCommand::Status { mailbox, items })
    }

    /// Parse FETCH command
    fn parse_fetch(args: &str, uid: bool) -> Option<ImapCommand> {
        let (set, items) = args.split_once(' ')?;
        let sequence = SequenceSet::parse(set)?;
        let items = FetchItem::parse_list(items)?;

        Some(ImapCommand::Fetch {
            sequence,
            items,
            uid,
        })
    }

    /// Parse SEARCH command
    fn parse_search(args: &str, uid: bool) -> Option<ImapCommand> {
        let tokens = Self::tokenize(args)?;
        let predicate = Self::parse_search_predicate(&tokens)?;
        Some(ImapCommand::Search { predicate, uid })
    }

    /// Fold search keys into one predicate. Unsupported keys fail the parse.
    fn parse_search_predicate(tokens: &[String]) -> Option<SearchPredicate> {
        let mut predicate = SearchPredicate::default();
        let mut iter = tokens.iter();

        while let Some(token) = iter.next() {
            let key = token.to_uppercase();
            match key.as_str() {
                "ALL" => {}
                "CHARSET" => {
                    let charset = iter.next()?.to_uppercase();
                    if charset != "UTF-8" && charset != "US-ASCII" {
                        return None;
                    }
                }
                "SEEN" => predicate.with_flags.push(Flag::Seen),
                "UNSEEN" => predicate.without_flags.push(Flag::Seen),
                "DELETED" => predicate.with_flags.push(Flag::Deleted),
                "UNDELETED" => predicate.without_flags.push(Flag::Deleted),
                "NOT" => match iter.next()?.to_uppercase().as_str() {
                    "SEEN" => predicate.without_flags.push(Flag::Seen),
                    "UNSEEN" => predicate.with_flags.push(Flag::Seen),
                    "DELETED" => predicate.without_flags.push(Flag::Deleted),
                    "UNDELETED" => predicate.with_flags.push(Flag::Deleted),
                    _ => return None,
                },
                "FROM" => predicate
                    .headers
                    .push((HeaderField::From, iter.next()?.clone())),
                "TO" => predicate
                    .headers
                    .push((HeaderField::To, iter.next()?.clone())),
                "SUBJECT" => predicate
                    .headers
                    .push((HeaderField::Subject, iter.next()?.clone())),
                "HEADER" => {
                    let field = HeaderField::from_name(iter.next()?)?;
                    predicate.headers.push((field, iter.next()?.clone()));
                }
                "BODY" => predicate.body.push(iter.next()?.clone()),
                "TEXT" => predicate.text.push(iter.next()?.clone()),
                "SINCE" => predicate.add_since(day_start(Self::parse_date(iter.next()?)?)),
                "BEFORE" => {
                    let start = day_start(Self::parse_date(iter.next()?)?);
                    predicate.add_before(start - Duration::nanoseconds(1));
                }
                "ON" => {
                    let date = Self::parse_date(iter.next()?)?;
                    predicate.add_since(day_start(date));
                    predicate.add_before(day_start(date.succ_opt()?) - Duration::nanoseconds(1));
                }
                _ => return None,
            }
        }

        Some(predicate)
    }

    /// IMAP date: `1-Feb-1994` or `01-Feb-1994`
    fn parse_date(s: &str) -> Option<NaiveDate> {
        NaiveDate::parse_from_str(s, "%d-%b-%Y").ok()
    }

    /// Parse UID FETCH/SEARCH/STORE/COPY/MOVE/EXPUNGE commands
    fn parse_uid_command(args: &str) -> Option<ImapCommand> {
        let (subcmd, subargs) = args.split_once(' ').unwrap_or((args, ""));
        let subcmd = subcmd.to_uppercase();
        let subargs = subargs.trim();

        match subcmd.as_str() {
            "FETCH" => Self::parse_fetch(subargs, true),
            "SEARCH" => Self::parse_search(subargs, true),
            "STORE" => Self::parse_store(subargs, true),
            "COPY" => Self::parse_copy(subargs, true),
            "MOVE" => Self::parse_move(subargs, true),
            "EXPUNGE" => Some(ImapCommand::Expunge {
                uids: Some(SequenceSet::parse(subargs)?),
            }),
            _ => Some(ImapCommand::Unknown {
                command: format!("UID {}", subcmd),
            }),
        }
    }

    /// Parse RENAME command
    fn parse_rename(args: &str) -> Option<ImapCommand> {
        let (old_mailbox, new_mailbox) = Self::parse_two_astrings(args)?;
        Some(ImapCommand::Rename {
            old_mailbox,
            new_mailbox,
        })
    }

    /// Parse STORE command
    fn parse_store(args: &str, uid: bool) -> Option<ImapCommand> {
        // STORE sequence +FLAGS|-FLAGS|FLAGS[.SILENT] (flags...)
        let (set, rest) = args.split_once(' ')?;
        let sequence = SequenceSet::parse(set)?;
        let flags = Self::parse_store_flags(rest)?;

        Some(ImapCommand::Store {
            sequence,
            flags,
            uid,
        })
    }

    /// Parse STORE flags specification
    fn parse_store_flags(args: &str) -> Option<StoreFlags> {
        let (item, rest) = args.trim().split_once(' ')?;
        let item = item.to_uppercase();

        let (operation, name) = match item.as_bytes().first()? {
            b'+' => (FlagOperation::Add, &item[1..]),
            b'-' => (FlagOperation::Remove, &item[1..]),
            _ => (FlagOperation::Set, item.as_str()),
        };
        let silent = match name {
            "FLAGS" => false,
            "FLAGS.SILENT" => true,
            _ => return None,
        };

        Some(StoreFlags {
            operation,
            silent,
            flags: Self::parse_flags_list(rest),
        })
    }

    /// Parse a parenthesized flags list
    fn parse_flags_list(args: &str) -> Vec<String> {
        let args = args.trim();
        let content = args
            .strip_prefix('(')
            .and_then(|s| s.strip_suffix(')'))
            .unwrap_or(args);

        content.split_whitespace().map(|s| s.to_string()).collect()
    }

    /// Parse COPY command
    fn parse_copy(args: &str, uid: bool) -> Option<ImapCommand> {
        let (set, mailbox) = args.split_once(' ')?;
        Some(ImapCommand::Copy {
            sequence: SequenceSet::parse(set)?,
            mailbox: Self::parse_mailbox(mailbox)?,
            uid,
        })
    }

    /// Parse MOVE command (IMAP extension)
    fn parse_move(args: &str, uid: bool) -> Option<ImapCommand> {
        let (set, mailbox) = args.split_once(' ')?;
        Some(ImapCommand::Move {
            sequence: SequenceSet::parse(set)?,
            mailbox: Self::parse_mailbox(mailbox)?,
            uid,
        })
    }

    /// Parse mailbox name
    fn parse_mailbox(s: &str) -> Option<String> {
        let (name, _) = Self::parse_astring(s)?;
        (!name.is_empty()).then_some(name)
    }

    fn parse_two_astrings(args: &str) -> Option<(String, String)> {
        let (first, rest) = Self::parse_astring(args)?;
        let (second, _) = Self::parse_astring(rest)?;
        Some((first, second))
    }

    /// Split arguments into atoms and quoted strings
    fn tokenize(args: &str) -> Option<Vec<String>> {
        let mut tokens = Vec::new();
        let mut rest = args.trim();
        while !rest.is_empty() {
            let (token, remaining) = Self::parse_astring(rest)?;
            tokens.push(token);
            rest = remaining.trim_start();
        }
        Some(tokens)
    }

    /// Parse an astring (atom or quoted string)
    /// Returns the parsed string and remaining input
    pub(crate) fn parse_astring(s: &str) -> Option<(String, &str)> {
        let s = s.trim_start();

        if let Some(quoted) = s.strip_prefix('"') {
            let mut result = String::new();
            let mut escaped = false;

            for (idx, c) in quoted.char_indices() {
                if escaped {
                    result.push(c);
                    escaped = false;
                } else if c == '\\' {
                    escaped = true;
                } else if c == '"' {
                    return Some((result, &quoted[idx + 1..]));
                } else {
                    result.push(c);
                }
            }

            // Unterminated quoted string
            None
        } else {
            // Atom (space-delimited)
            if s.is_empty() {
                return None;
            }
            let end = s.find(' ').unwrap_or(s.len());
            Some((s[..end].to_string(), &s[end..]))
        }
    }
}

fn day_start(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_time(chrono::NaiveTime::MIN))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imap::uid::{SeqBound, SeqRange};
    use pretty_assertions::assert_eq;

    fn parse(line: &str) -> ImapCommand {
        ImapParser::parse(line).unwrap().command
    }

    #[test]
    fn test_parse_capability() {
        let cmd = ImapParser::parse("A001 CAPABILITY").unwrap();
        assert_eq!(cmd.tag, "A001");
        assert!(matches!(cmd.command, ImapCommand::Capability));
    }

    #[test]
    fn test_parse_login_quoted() {
        match parse(r#"A002 LOGIN "user@example.com" "pass \"word\"""#) {
            ImapCommand::Login { username, password } => {
                assert_eq!(username, "user@example.com");
                assert_eq!(password, "pass \"word\"");
            }
            other => panic!("Expected LOGIN, got {:?}", other),
        }
        assert!(ImapParser::parse("A002 LOGIN onlyuser").is_none());
    }

    #[test]
    fn test_parse_fetch() {
        match parse("A004 FETCH 1:* (FLAGS UID)") {
            ImapCommand::Fetch { sequence, items, uid } => {
                assert!(!uid);
                assert_eq!(sequence, SequenceSet::all());
                assert_eq!(items, vec![FetchItem::Flags, FetchItem::Uid]);
            }
            other => panic!("Expected FETCH, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_uid_fetch() {
        match parse("A005 UID FETCH 1:100 FLAGS") {
            ImapCommand::Fetch { sequence, uid, .. } => {
                assert!(uid);
                assert_eq!(
                    sequence.ranges(),
                    &[SeqRange::Range(SeqBound::Value(1), SeqBound::Value(100))]
                );
            }
            other => panic!("Expected UID FETCH, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_search_keys() {
        match parse(r#"A006 UID SEARCH UNDELETED FROM alice SUBJECT "weekly report" NOT SEEN"#) {
            ImapCommand::Search { predicate, uid } => {
                assert!(uid);
                assert_eq!(predicate.without_flags, vec![Flag::Deleted, Flag::Seen]);
                assert_eq!(
                    predicate.headers,
                    vec![
                        (HeaderField::From, "alice".to_string()),
                        (HeaderField::Subject, "weekly report".to_string())
                    ]
                );
            }
            other => panic!("Expected SEARCH, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_search_dates() {
        match parse("A007 SEARCH ON 5-Mar-2024") {
            ImapCommand::Search { predicate, .. } => {
                let start = Utc.with_ymd_and_hms(2024, 3, 5, 0, 0, 0).unwrap();
                let next = Utc.with_ymd_and_hms(2024, 3, 6, 0, 0, 0).unwrap();
                assert_eq!(predicate.since, Some(start));
                assert_eq!(predicate.before, Some(next - Duration::nanoseconds(1)));
            }
            other => panic!("Expected SEARCH, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_search_rejects_unsupported_keys() {
        assert!(ImapParser::parse("A008 SEARCH FLAGGED").is_none());
        assert!(ImapParser::parse("A008 SEARCH HEADER Cc bob").is_none());
        assert!(ImapParser::parse("A008 SEARCH SINCE yesterday").is_none());
        assert!(ImapParser::parse("A008 SEARCH FROM").is_none());
    }

    #[test]
    fn test_parse_store() {
        match parse("A009 STORE 1:3 +FLAGS.SILENT (\\Seen \\Deleted)") {
            ImapCommand::Store { flags, uid, .. } => {
                assert!(!uid);
                assert_eq!(
                    flags,
                    StoreFlags {
                        operation: FlagOperation::Add,
                        silent: true,
                        flags: vec!["\\Seen".into(), "\\Deleted".into()],
                    }
                );
            }
            other => panic!("Expected STORE, got {:?}", other),
        }

        match parse("A010 UID STORE 7 FLAGS (\\Seen)") {
            ImapCommand::Store { flags, uid, .. } => {
                assert!(uid);
                assert_eq!(flags.operation, FlagOperation::Set);
                assert!(!flags.silent);
            }
            other => panic!("Expected STORE, got {:?}", other),
        }

        assert!(ImapParser::parse("A011 STORE 1 LABELS (x)").is_none());
    }

    #[test]
    fn test_parse_expunge() {
        assert!(matches!(
            parse("A012 EXPUNGE"),
            ImapCommand::Expunge { uids: None }
        ));
        match parse("A013 UID EXPUNGE 3:5") {
            ImapCommand::Expunge { uids: Some(set) } => assert_eq!(set, SequenceSet::range(3, 5)),
            other => panic!("Expected UID EXPUNGE, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_list_and_status() {
        match parse(r#"A014 LIST "" "*""#) {
            ImapCommand::List { reference, pattern } => {
                assert_eq!(reference, "");
                assert_eq!(pattern, "*");
            }
            other => panic!("Expected LIST, got {:?}", other),
        }
        match parse("A015 STATUS INBOX (MESSAGES uidnext)") {
            ImapCommand::Status { mailbox, items } => {
                assert_eq!(mailbox, "INBOX");
                assert_eq!(items, vec!["MESSAGES", "UIDNEXT"]);
            }
            other => panic!("Expected STATUS, got {:?}", other),
        }
    }

    #[test]
    fn test_tag_of() {
        assert_eq!(ImapParser::tag_of("A016 FETCH bogus"), Some("A016"));
        assert_eq!(ImapParser::tag_of("garbage"), None);
    }
}
