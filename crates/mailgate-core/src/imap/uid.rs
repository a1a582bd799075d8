//! Sequence set parsing and UID resolution
//!
//! A sequence set addresses messages either by UID or by 1-based position
//! in the deleted-inclusive, UID-ordered listing of the mailbox. The `*`
//! wildcard is carried as [`SeqBound::Last`] and resolved against the
//! listing at resolution time, so it can never be confused with a literal
//! boundary value.

use mailgate_common::types::InboxId;
use mailgate_common::Result;
use mailgate_storage::MessageStore;
use std::collections::HashSet;

/// Upper bound on the number of UIDs produced by one range
pub const MAX_RANGE_SPAN: usize = 10_000;

/// One endpoint of a sequence range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqBound {
    Value(u32),
    /// `*`: the highest sequence number or UID currently in the mailbox
    Last,
}

impl SeqBound {
    fn parse(s: &str) -> Option<Self> {
        if s == "*" {
            return Some(SeqBound::Last);
        }
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        s.parse().ok().map(SeqBound::Value)
    }
}

/// A single element of a sequence set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqRange {
    Single(SeqBound),
    /// Inclusive range, endpoints as written by the client
    Range(SeqBound, SeqBound),
}

/// Comma-separated list of sequence ranges
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceSet {
    ranges: Vec<SeqRange>,
}

/// How a sequence set addresses messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressingMode {
    Sequence,
    Uid,
}

impl AddressingMode {
    pub fn from_uid_flag(uid: bool) -> Self {
        if uid {
            AddressingMode::Uid
        } else {
            AddressingMode::Sequence
        }
    }
}

impl SequenceSet {
    pub fn new(ranges: Vec<SeqRange>) -> Self {
        Self { ranges }
    }

    pub fn single(value: u32) -> Self {
        Self::new(vec![SeqRange::Single(SeqBound::Value(value))])
    }

    pub fn range(start: u32, stop: u32) -> Self {
        Self::new(vec![SeqRange::Range(
            SeqBound::Value(start),
            SeqBound::Value(stop),
        )])
    }

    /// `1:*`
    pub fn all() -> Self {
        Self::new(vec![SeqRange::Range(SeqBound::Value(1), SeqBound::Last)])
    }

    pub fn ranges(&self) -> &[SeqRange] {
        &self.ranges
    }

    /// Parse wire syntax such as `1,3:5,7:*`. Any malformed element rejects
    /// the whole set.
    pub fn parse(s: &str) -> Option<Self> {
        let mut ranges = Vec::new();
        for part in s.trim().split(',') {
            let range = match part.split_once(':') {
                Some((start, stop)) => {
                    SeqRange::Range(SeqBound::parse(start)?, SeqBound::parse(stop)?)
                }
                None => SeqRange::Single(SeqBound::parse(part)?),
            };
            ranges.push(range);
        }
        Some(Self { ranges })
    }

    /// Whether any element is a range rather than a single value
    pub fn has_ranges(&self) -> bool {
        self.ranges
            .iter()
            .any(|range| matches!(range, SeqRange::Range(..)))
    }

    /// Whether any element uses the `*` wildcard
    pub fn uses_last(&self) -> bool {
        self.ranges.iter().any(|range| match range {
            SeqRange::Single(bound) => *bound == SeqBound::Last,
            SeqRange::Range(start, stop) => *start == SeqBound::Last || *stop == SeqBound::Last,
        })
    }
}

/// Resolve a set to UIDs against the deleted-inclusive UID listing.
///
/// `all_uids` must be ascending. In UID mode single values are taken as
/// written and may name UIDs that no longer exist, while a range selects
/// the UIDs of `all_uids` that fall inside it, so sparse UIDs far past the
/// start of the range stay reachable. In sequence mode positions are mapped
/// onto `all_uids`. Zero endpoints and literal descending ranges are
/// dropped, each range yields at most [`MAX_RANGE_SPAN`] UIDs, and
/// duplicates are removed keeping the first occurrence.
pub fn resolve(set: &SequenceSet, mode: AddressingMode, all_uids: &[u32]) -> Vec<u32> {
    let last = match mode {
        AddressingMode::Uid => all_uids.last().copied(),
        AddressingMode::Sequence => u32::try_from(all_uids.len()).ok().filter(|&n| n > 0),
    };

    let bound = |b: SeqBound| match b {
        SeqBound::Value(v) => Some(v),
        SeqBound::Last => last,
    };

    let mut seen = HashSet::new();
    let mut out = Vec::new();

    for range in set.ranges() {
        let (lo, hi) = match *range {
            SeqRange::Single(b) => match bound(b) {
                Some(v) => (v, v),
                None => continue,
            },
            SeqRange::Range(start, stop) => {
                let (Some(a), Some(b)) = (bound(start), bound(stop)) else {
                    continue;
                };
                let literal = start != SeqBound::Last && stop != SeqBound::Last;
                if a > b && literal {
                    continue;
                }
                (a.min(b), a.max(b))
            }
        };
        if lo == 0 {
            continue;
        }

        let values: Box<dyn Iterator<Item = u32>> = match mode {
            AddressingMode::Uid if lo == hi => Box::new(std::iter::once(lo)),
            AddressingMode::Uid => {
                let start = all_uids.partition_point(|&uid| uid < lo);
                let end = all_uids.partition_point(|&uid| uid <= hi);
                Box::new(
                    all_uids[start..end]
                        .iter()
                        .copied()
                        .take(MAX_RANGE_SPAN),
                )
            }
            AddressingMode::Sequence => {
                let count = all_uids.len();
                let lo = lo as usize;
                if lo > count {
                    continue;
                }
                let hi = (hi as usize).min(count);
                Box::new(
                    all_uids[lo - 1..hi]
                        .iter()
                        .copied()
                        .take(MAX_RANGE_SPAN),
                )
            }
        };

        for uid in values {
            if seen.insert(uid) {
                out.push(uid);
            }
        }
    }

    out
}

/// Resolve a set for one inbox, loading the UID listing unless the set is
/// made of single UIDs only
pub async fn resolve_sequence_set(
    store: &dyn MessageStore,
    inbox_id: InboxId,
    set: &SequenceSet,
    mode: AddressingMode,
) -> Result<Vec<u32>> {
    let all_uids = if mode == AddressingMode::Sequence || set.uses_last() || set.has_ranges() {
        store.get_all_uids_including_deleted(inbox_id).await?
    } else {
        Vec::new()
    };
    Ok(resolve(set, mode, &all_uids))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn parse(s: &str) -> SequenceSet {
        SequenceSet::parse(s).unwrap()
    }

    #[test]
    fn test_parse() {
        assert_eq!(parse("1"), SequenceSet::single(1));
        assert_eq!(parse("1:5"), SequenceSet::range(1, 5));
        assert_eq!(parse("1:*"), SequenceSet::all());
        assert_eq!(
            parse("2,4:*,*").ranges(),
            &[
                SeqRange::Single(SeqBound::Value(2)),
                SeqRange::Range(SeqBound::Value(4), SeqBound::Last),
                SeqRange::Single(SeqBound::Last),
            ]
        );
        // u32::MAX is a literal value, not a wildcard
        assert_eq!(
            parse("4294967295"),
            SequenceSet::single(u32::MAX)
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(SequenceSet::parse("").is_none());
        assert!(SequenceSet::parse("1,,2").is_none());
        assert!(SequenceSet::parse("a:3").is_none());
        assert!(SequenceSet::parse("-1").is_none());
        assert!(SequenceSet::parse("4294967296").is_none());
    }

    #[test]
    fn test_uid_mode_singles_taken_as_written() {
        let uids = resolve(&parse("3,9,4"), AddressingMode::Uid, &[]);
        assert_eq!(uids, vec![3, 9, 4]);
    }

    #[test]
    fn test_uid_mode_ranges_select_existing() {
        let all = [2, 7, 8, 12];
        assert_eq!(resolve(&parse("3:9"), AddressingMode::Uid, &all), vec![7, 8]);
        assert_eq!(resolve(&parse("1:100"), AddressingMode::Uid, &all), vec![2, 7, 8, 12]);
        assert!(resolve(&parse("9:11"), AddressingMode::Uid, &all).is_empty());
        assert!(resolve(&parse("3:9"), AddressingMode::Uid, &[]).is_empty());
    }

    #[test]
    fn test_uid_mode_reaches_uids_past_the_cap() {
        let all = [20_001, 20_002, 20_003];
        assert_eq!(
            resolve(&parse("1:*"), AddressingMode::Uid, &all),
            vec![20_001, 20_002, 20_003]
        );
        assert_eq!(
            resolve(&parse("1:4000000000"), AddressingMode::Uid, &all),
            vec![20_001, 20_002, 20_003]
        );
    }

    #[test]
    fn test_uid_mode_wildcard() {
        let all = [10, 11, 12];
        assert_eq!(resolve(&parse("11:*"), AddressingMode::Uid, &all), vec![11, 12]);
        assert_eq!(resolve(&parse("*"), AddressingMode::Uid, &all), vec![12]);
        // n:* with n above the highest UID still names the highest UID
        assert_eq!(resolve(&parse("14:*"), AddressingMode::Uid, &all), vec![12]);
        assert!(resolve(&parse("1:*"), AddressingMode::Uid, &[]).is_empty());
    }

    #[test]
    fn test_literal_max_is_not_wildcard() {
        let all = [10, 11, 12];
        assert_eq!(
            resolve(&SequenceSet::single(u32::MAX), AddressingMode::Uid, &all),
            vec![u32::MAX]
        );
    }

    #[test]
    fn test_invalid_ranges_dropped() {
        assert!(resolve(&parse("0"), AddressingMode::Uid, &[]).is_empty());
        assert!(resolve(&parse("0:3"), AddressingMode::Uid, &[]).is_empty());
        assert!(resolve(&parse("5:3"), AddressingMode::Uid, &[]).is_empty());
        assert_eq!(resolve(&parse("5:3,4"), AddressingMode::Uid, &[]), vec![4]);
    }

    #[test]
    fn test_range_cap() {
        let all: Vec<u32> = (1..=20_000).collect();
        let uids = resolve(&parse("1:4000000000"), AddressingMode::Uid, &all);
        assert_eq!(uids.len(), MAX_RANGE_SPAN);
        assert_eq!(uids.last().copied(), Some(MAX_RANGE_SPAN as u32));

        let uids = resolve(&parse("1:*"), AddressingMode::Sequence, &all);
        assert_eq!(uids.len(), MAX_RANGE_SPAN);
    }

    #[test]
    fn test_sequence_mode_maps_positions() {
        let all = [10, 11, 12];
        assert_eq!(resolve(&parse("2"), AddressingMode::Sequence, &all), vec![11]);
        assert_eq!(resolve(&parse("2:*"), AddressingMode::Sequence, &all), vec![11, 12]);
        assert_eq!(resolve(&parse("*"), AddressingMode::Sequence, &all), vec![12]);
        assert_eq!(resolve(&parse("2:9"), AddressingMode::Sequence, &all), vec![11, 12]);
        assert!(resolve(&parse("4"), AddressingMode::Sequence, &all).is_empty());
        assert!(resolve(&parse("*"), AddressingMode::Sequence, &[]).is_empty());
    }

    #[test]
    fn test_sequence_positions_shift_after_removal() {
        let before = [10, 11, 12];
        let after = [11, 12];
        let set = parse("2");
        assert_eq!(resolve(&set, AddressingMode::Sequence, &before), vec![11]);
        assert_eq!(resolve(&set, AddressingMode::Sequence, &after), vec![12]);
    }

    #[test]
    fn test_duplicates_removed_in_order() {
        let all = [10, 11, 12];
        assert_eq!(
            resolve(&parse("3,1:2,2"), AddressingMode::Sequence, &all),
            vec![12, 10, 11]
        );
    }
}
