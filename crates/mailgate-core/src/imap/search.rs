//! Search predicate evaluation
//!
//! Text and date conditions are matched here, in memory. Flag conditions
//! are not: they become [`MessageFilters`] and are applied by the store
//! before candidates are fetched.

use super::mailbox::Flag;
use chrono::{DateTime, Utc};
use mailgate_storage::{MessageFilters, StoredMessage};

/// Header a search term applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderField {
    From,
    To,
    Subject,
}

impl HeaderField {
    /// Map a header name to the stored column it is searched in
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "from" => Some(HeaderField::From),
            "to" => Some(HeaderField::To),
            "subject" => Some(HeaderField::Subject),
            _ => None,
        }
    }

    fn value<'a>(&self, message: &'a StoredMessage) -> &'a str {
        match self {
            HeaderField::From => &message.sender,
            HeaderField::To => &message.receiver,
            HeaderField::Subject => &message.subject,
        }
    }
}

/// Conjunction of search conditions. The default value matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchPredicate {
    pub headers: Vec<(HeaderField, String)>,
    pub body: Vec<String>,
    /// Matched against subject, sender, receiver and body together
    pub text: Vec<String>,
    /// Excludes messages created strictly before this instant
    pub since: Option<DateTime<Utc>>,
    /// Excludes messages created strictly after this instant
    pub before: Option<DateTime<Utc>>,
    pub with_flags: Vec<Flag>,
    pub without_flags: Vec<Flag>,
}

impl SearchPredicate {
    /// Tighten the lower date bound
    pub fn add_since(&mut self, bound: DateTime<Utc>) {
        self.since = Some(self.since.map_or(bound, |current| current.max(bound)));
    }

    /// Tighten the upper date bound
    pub fn add_before(&mut self, bound: DateTime<Utc>) {
        self.before = Some(self.before.map_or(bound, |current| current.min(bound)));
    }

    /// Store-level filters for the flag conditions, or `None` when the
    /// conditions contradict each other and nothing can match.
    ///
    /// Deleted messages are excluded unless the predicate asks for them.
    pub fn store_filters(&self) -> Option<MessageFilters> {
        Some(MessageFilters {
            is_read: self.flag_filter(Flag::Seen)?,
            is_deleted: Some(self.flag_filter(Flag::Deleted)?.unwrap_or(false)),
        })
    }

    fn flag_filter(&self, flag: Flag) -> Option<Option<bool>> {
        let with = self.with_flags.contains(&flag);
        let without = self.without_flags.contains(&flag);
        match (with, without) {
            (true, true) => None,
            (true, false) => Some(Some(true)),
            (false, true) => Some(Some(false)),
            (false, false) => Some(None),
        }
    }
}

fn contains_ci(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

/// Evaluate the text and date conditions of `predicate` against a message
pub fn matches(message: &StoredMessage, predicate: &SearchPredicate) -> bool {
    if let Some(since) = predicate.since {
        if message.created_at < since {
            return false;
        }
    }
    if let Some(before) = predicate.before {
        if message.created_at > before {
            return false;
        }
    }

    let headers_match = predicate
        .headers
        .iter()
        .all(|(field, term)| contains_ci(field.value(message), term));

    let body_match = predicate
        .body
        .iter()
        .all(|term| contains_ci(&message.body, term));

    let text_match = predicate.text.iter().all(|term| {
        contains_ci(&message.subject, term)
            || contains_ci(&message.sender, term)
            || contains_ci(&message.receiver, term)
            || contains_ci(&message.body, term)
    });

    headers_match && body_match && text_match
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use uuid::Uuid;

    fn message() -> StoredMessage {
        StoredMessage {
            id: Uuid::new_v4(),
            inbox_id: Uuid::new_v4(),
            uid: 1,
            sender: "Alice <alice@remote.test>".to_string(),
            receiver: "bob@example.org".to_string(),
            subject: "Quarterly Report".to_string(),
            body: "Numbers are UP this quarter".to_string(),
            is_read: false,
            is_deleted: false,
            created_at: Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_empty_predicate_matches() {
        assert!(matches(&message(), &SearchPredicate::default()));
    }

    #[test]
    fn test_header_terms_are_case_insensitive_substrings() {
        let mut predicate = SearchPredicate::default();
        predicate.headers.push((HeaderField::Subject, "report".into()));
        predicate.headers.push((HeaderField::From, "ALICE@".into()));
        assert!(matches(&message(), &predicate));

        predicate.headers.push((HeaderField::To, "carol".into()));
        assert!(!matches(&message(), &predicate));
    }

    #[test]
    fn test_body_and_text_terms() {
        let body = SearchPredicate {
            body: vec!["up this".into()],
            ..Default::default()
        };
        assert!(matches(&message(), &body));

        let body_only = SearchPredicate {
            body: vec!["quarterly".into()],
            ..Default::default()
        };
        assert!(!matches(&message(), &body_only));

        let text = SearchPredicate {
            text: vec!["quarterly".into(), "example.org".into()],
            ..Default::default()
        };
        assert!(matches(&message(), &text));
    }

    #[test]
    fn test_date_bounds_are_strict() {
        let created = message().created_at;

        let mut at_bounds = SearchPredicate::default();
        at_bounds.add_since(created);
        at_bounds.add_before(created);
        assert!(matches(&message(), &at_bounds));

        let mut later = SearchPredicate::default();
        later.add_since(created + Duration::seconds(1));
        assert!(!matches(&message(), &later));

        let mut earlier = SearchPredicate::default();
        earlier.add_before(created - Duration::seconds(1));
        assert!(!matches(&message(), &earlier));
    }

    #[test]
    fn test_bounds_tighten() {
        let t = message().created_at;
        let mut predicate = SearchPredicate::default();
        predicate.add_since(t - Duration::days(2));
        predicate.add_since(t - Duration::days(1));
        predicate.add_before(t + Duration::days(2));
        predicate.add_before(t + Duration::days(1));
        assert_eq!(predicate.since, Some(t - Duration::days(1)));
        assert_eq!(predicate.before, Some(t + Duration::days(1)));
    }

    #[test]
    fn test_store_filters() {
        assert_eq!(
            SearchPredicate::default().store_filters(),
            Some(MessageFilters {
                is_read: None,
                is_deleted: Some(false)
            })
        );

        let deleted_unseen = SearchPredicate {
            with_flags: vec![Flag::Deleted],
            without_flags: vec![Flag::Seen],
            ..Default::default()
        };
        assert_eq!(
            deleted_unseen.store_filters(),
            Some(MessageFilters {
                is_read: Some(false),
                is_deleted: Some(true)
            })
        );

        let contradiction = SearchPredicate {
            with_flags: vec![Flag::Seen],
            without_flags: vec![Flag::Seen],
            ..Default::default()
        };
        assert_eq!(contradiction.store_filters(), None);
    }
}
