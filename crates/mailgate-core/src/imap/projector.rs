//! Message projection
//!
//! Turns a stored message plus the requested FETCH items into protocol
//! values. The store keeps no raw MIME, so full-message requests get a
//! synthetic header block in front of the body and the original transport
//! headers are not reproduced. Peek and non-peek section fetches behave the
//! same: nothing here marks a message as seen.

use super::command::FetchItem;
use super::mailbox::Flag;
use chrono::{DateTime, Utc};
use mailgate_common::Address;
use mailgate_storage::StoredMessage;
use tracing::debug;

/// Added to the text lengths when estimating RFC822.SIZE
pub const HEADER_OVERHEAD: usize = 200;

/// `Date:` header format of the rendered message
const HEADER_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S %z";

/// Envelope built from the stored sender, receiver and subject
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub date: DateTime<Utc>,
    pub subject: String,
    pub from: Vec<Address>,
    pub sender: Vec<Address>,
    pub to: Vec<Address>,
}

/// Single-part text/plain body structure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BodyStructure {
    pub size: usize,
    pub lines: usize,
}

/// One projected FETCH attribute
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchValue {
    Flags(Vec<Flag>),
    Uid(u32),
    InternalDate(DateTime<Utc>),
    Rfc822Size(usize),
    Envelope(Envelope),
    BodyStructure(BodyStructure),
    /// Body text only
    Body(String),
    /// Literal content under a wire label such as `BODY[]` or `RFC822`
    Section {
        label: String,
        origin: Option<u32>,
        content: String,
    },
}

/// Expand the ALL/FAST/FULL macros into their component items
pub fn expand_items(items: &[FetchItem]) -> Vec<FetchItem> {
    let mut expanded = Vec::with_capacity(items.len());
    let mut push = |item: FetchItem| {
        if !expanded.contains(&item) {
            expanded.push(item);
        }
    };

    for item in items {
        match item {
            FetchItem::Fast => {
                push(FetchItem::Flags);
                push(FetchItem::InternalDate);
                push(FetchItem::Rfc822Size);
            }
            FetchItem::All | FetchItem::Full => {
                push(FetchItem::Flags);
                push(FetchItem::InternalDate);
                push(FetchItem::Rfc822Size);
                push(FetchItem::Envelope);
                if *item == FetchItem::Full {
                    push(FetchItem::BodyStructure);
                }
            }
            other => push(other.clone()),
        }
    }

    expanded
}

/// Project one message onto the requested items, in request order
pub fn project(message: &StoredMessage, items: &[FetchItem]) -> Vec<FetchValue> {
    expand_items(items)
        .into_iter()
        .map(|item| project_item(message, &item))
        .collect()
}

fn project_item(message: &StoredMessage, item: &FetchItem) -> FetchValue {
    match item {
        FetchItem::Flags => FetchValue::Flags(flags(message)),
        FetchItem::Uid => FetchValue::Uid(message.uid),
        FetchItem::InternalDate => FetchValue::InternalDate(message.created_at),
        FetchItem::Rfc822Size => FetchValue::Rfc822Size(size_estimate(message)),
        FetchItem::Envelope => FetchValue::Envelope(envelope(message)),
        FetchItem::BodyStructure => FetchValue::BodyStructure(BodyStructure {
            size: message.body.len(),
            lines: message.body.lines().count(),
        }),
        FetchItem::Body => FetchValue::Body(message.body.clone()),
        FetchItem::Rfc822 => FetchValue::Section {
            label: "RFC822".to_string(),
            origin: None,
            content: render_full(message),
        },
        FetchItem::BodySection { section, partial } | FetchItem::BodyPeek { section, partial } => {
            // No part structure is stored; every section gets the full rendering
            let full = render_full(message);
            let content = match partial {
                Some((start, len)) => slice_partial(&full, *start, *len).to_string(),
                None => full,
            };
            FetchValue::Section {
                label: format!("BODY[{}]", section),
                origin: partial.map(|(start, _)| start),
                content,
            }
        }
        // Macros are expanded before projection
        FetchItem::All | FetchItem::Fast | FetchItem::Full => {
            FetchValue::Flags(flags(message))
        }
    }
}

/// Protocol flags derived from the two stored booleans
pub fn flags(message: &StoredMessage) -> Vec<Flag> {
    let mut flags = Vec::with_capacity(2);
    if message.is_read {
        flags.push(Flag::Seen);
    }
    if message.is_deleted {
        flags.push(Flag::Deleted);
    }
    flags
}

/// Approximate size; not the byte length of any rendered form
pub fn size_estimate(message: &StoredMessage) -> usize {
    message.subject.len()
        + message.sender.len()
        + message.receiver.len()
        + message.body.len()
        + HEADER_OVERHEAD
}

fn envelope(message: &StoredMessage) -> Envelope {
    let from = parse_address_list(&message.sender);
    Envelope {
        date: message.created_at,
        subject: message.subject.clone(),
        sender: from.clone(),
        from,
        to: parse_address_list(&message.receiver),
    }
}

/// Unparseable addresses are left out of the envelope
fn parse_address_list(raw: &str) -> Vec<Address> {
    match Address::parse(raw) {
        Ok(address) => vec![address],
        Err(e) => {
            debug!(address = %raw, error = %e, "Omitting address from envelope");
            Vec::new()
        }
    }
}

/// Synthetic RFC 5322 rendering of a stored message
pub fn render_full(message: &StoredMessage) -> String {
    format!(
        "From: {}\r\nTo: {}\r\nSubject: {}\r\nDate: {}\r\nContent-Type: text/plain; charset=UTF-8\r\nMIME-Version: 1.0\r\n\r\n{}",
        message.sender,
        message.receiver,
        message.subject,
        message.created_at.format(HEADER_DATE_FORMAT),
        message.body
    )
}

/// `<start.len>` partial fetch, widened to UTF-8 character boundaries
fn slice_partial(content: &str, start: u32, len: u32) -> &str {
    let mut from = (start as usize).min(content.len());
    while !content.is_char_boundary(from) {
        from -= 1;
    }
    let mut to = from.saturating_add(len as usize).min(content.len());
    while !content.is_char_boundary(to) {
        to += 1;
    }
    &content[from..to]
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use uuid::Uuid;

    fn message() -> StoredMessage {
        StoredMessage {
            id: Uuid::new_v4(),
            inbox_id: Uuid::new_v4(),
            uid: 42,
            sender: "A <a@x.com>".to_string(),
            receiver: "b@y.com".to_string(),
            subject: "Hi".to_string(),
            body: "Hello".to_string(),
            is_read: true,
            is_deleted: false,
            created_at: Utc.with_ymd_and_hms(2024, 3, 5, 14, 30, 0).unwrap(),
        }
    }

    #[test]
    fn test_full_rendering() {
        let rendered = render_full(&message());
        assert_eq!(
            rendered,
            "From: A <a@x.com>\r\nTo: b@y.com\r\nSubject: Hi\r\nDate: Tue, 05 Mar 2024 14:30:00 +0000\r\nContent-Type: text/plain; charset=UTF-8\r\nMIME-Version: 1.0\r\n\r\nHello"
        );
        assert!(rendered.ends_with("\r\n\r\nHello"));
    }

    #[test]
    fn test_flags_and_uid() {
        let mut msg = message();
        let values = project(&msg, &[FetchItem::Flags, FetchItem::Uid]);
        assert_eq!(values, vec![FetchValue::Flags(vec![Flag::Seen]), FetchValue::Uid(42)]);

        msg.is_read = false;
        msg.is_deleted = true;
        assert_eq!(flags(&msg), vec![Flag::Deleted]);

        // Stable across calls
        assert_eq!(project(&msg, &[FetchItem::Uid]), project(&msg, &[FetchItem::Uid]));
    }

    #[test]
    fn test_size_estimate() {
        let msg = message();
        assert_eq!(size_estimate(&msg), 2 + 11 + 7 + 5 + HEADER_OVERHEAD);
    }

    #[test]
    fn test_envelope_omits_unparseable_addresses() {
        let mut msg = message();
        msg.receiver = "not-an-address".to_string();
        let env = envelope(&msg);
        assert_eq!(env.from.len(), 1);
        assert_eq!(env.from[0].display_name.as_deref(), Some("A"));
        assert_eq!(env.sender, env.from);
        assert!(env.to.is_empty());
    }

    #[test]
    fn test_sections_use_full_rendering() {
        let msg = message();
        let expected = render_full(&msg);
        for item in [
            FetchItem::BodySection { section: "1".into(), partial: None },
            FetchItem::BodyPeek { section: "HEADER".into(), partial: None },
        ] {
            match project_item(&msg, &item) {
                FetchValue::Section { content, origin, .. } => {
                    assert_eq!(content, expected);
                    assert_eq!(origin, None);
                }
                other => panic!("unexpected value {:?}", other),
            }
        }
        assert_eq!(project_item(&msg, &FetchItem::Body), FetchValue::Body("Hello".into()));
    }

    #[test]
    fn test_partial_section() {
        let msg = message();
        let value = project_item(
            &msg,
            &FetchItem::BodyPeek { section: String::new(), partial: Some((0, 4)) },
        );
        assert_eq!(
            value,
            FetchValue::Section {
                label: "BODY[]".into(),
                origin: Some(0),
                content: "From".into()
            }
        );
        assert_eq!(slice_partial("héllo", 2, 1), "é");
        assert_eq!(slice_partial("abc", 10, 5), "");
    }

    #[test]
    fn test_expand_macros() {
        assert_eq!(
            expand_items(&[FetchItem::Fast, FetchItem::Flags]),
            vec![FetchItem::Flags, FetchItem::InternalDate, FetchItem::Rfc822Size]
        );
        assert_eq!(expand_items(&[FetchItem::Full]).len(), 5);
    }
}
