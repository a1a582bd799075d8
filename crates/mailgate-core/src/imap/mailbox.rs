//! Mailbox engine
//!
//! One [`Mailbox`] wraps one inbox and answers the access protocol's
//! status, fetch, search, store and expunge requests against the message
//! store. Nothing is cached between calls; every request re-reads the
//! store. Multi-step operations are not isolated from other connections,
//! so a message removed between UID enumeration and fetch is skipped
//! rather than reported as an error.

use super::command::FetchItem;
use super::error::MailboxError;
use super::projector::{self, FetchValue};
use super::search::{self, SearchPredicate};
use super::uid::{self, AddressingMode, SequenceSet};
use mailgate_common::types::{InboxId, MessageId};
use mailgate_storage::{Inbox, MessageFilters, MessageStore};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Candidates fetched per store round trip during search and expunge
pub const BATCH_SIZE: usize = 100;

/// Flags backed by stored columns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Flag {
    Seen,
    Deleted,
}

impl Flag {
    /// Parse a wire flag name; anything but `\Seen` and `\Deleted` is unknown
    pub fn parse(name: &str) -> Option<Self> {
        if name.eq_ignore_ascii_case("\\Seen") {
            Some(Flag::Seen)
        } else if name.eq_ignore_ascii_case("\\Deleted") {
            Some(Flag::Deleted)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Flag::Seen => "\\Seen",
            Flag::Deleted => "\\Deleted",
        }
    }
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How STORE combines the given flags with the current ones
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagOperation {
    Add,
    Remove,
    /// Replace: flags not listed are cleared
    Set,
}

/// Mailbox status counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MailboxStatus {
    /// Messages not marked deleted
    pub messages: u32,
    /// Messages neither read nor deleted
    pub unseen: u32,
    /// Same as `unseen`; there is no per-session recent tracking
    pub recent: u32,
    pub uid_next: u32,
    pub uid_validity: u32,
}

/// One message produced by [`Mailbox::list_messages`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedMessage {
    /// Position in the deleted-inclusive listing at fetch time
    pub sequence: u32,
    pub uid: u32,
    pub values: Vec<FetchValue>,
}

/// Per-target results of a multi-target mutation
#[derive(Debug, Default)]
pub(crate) struct BatchOutcome {
    pub succeeded: usize,
    pub failed: Vec<(u32, mailgate_common::Error)>,
}

impl BatchOutcome {
    fn record(&mut self, uid: u32, result: mailgate_common::Result<()>) {
        match result {
            Ok(()) => self.succeeded += 1,
            Err(e) => self.failed.push((uid, e)),
        }
    }

    fn log(&self, inbox: &str, operation: &str) {
        if self.failed.is_empty() {
            debug!(inbox = %inbox, operation, succeeded = self.succeeded, "Batch completed");
            return;
        }
        for (uid, error) in &self.failed {
            warn!(inbox = %inbox, operation, uid, error = %error, "Batch item failed");
        }
        warn!(
            inbox = %inbox,
            operation,
            succeeded = self.succeeded,
            failed = self.failed.len(),
            "Batch completed with failures"
        );
    }
}

/// Access-protocol view of one inbox
#[derive(Clone)]
pub struct Mailbox {
    inbox: Inbox,
    store: Arc<dyn MessageStore>,
}

impl Mailbox {
    pub fn new(inbox: Inbox, store: Arc<dyn MessageStore>) -> Self {
        Self { inbox, store }
    }

    /// Protocol name of the mailbox: the inbox address
    pub fn name(&self) -> &str {
        &self.inbox.email
    }

    pub fn inbox_id(&self) -> InboxId {
        self.inbox.id
    }

    /// Epoch seconds of the inbox creation time, 1 when unknown
    pub fn uid_validity(&self) -> u32 {
        self.inbox
            .created_at
            .and_then(|created| u32::try_from(created.timestamp()).ok())
            .filter(|&secs| secs > 0)
            .unwrap_or(1)
    }

    /// Compute the mailbox status
    pub async fn status(&self) -> Result<MailboxStatus, MailboxError> {
        let (_, messages) = self
            .store
            .list_by_inbox(self.inbox.id, MessageFilters::live(), 1, 0)
            .await?;

        let unseen_filters = MessageFilters {
            is_read: Some(false),
            is_deleted: Some(false),
        };
        let (_, unseen) = self
            .store
            .list_by_inbox(self.inbox.id, unseen_filters, 1, 0)
            .await?;

        let max_uid = self.store.get_max_uid(self.inbox.id).await?;

        Ok(MailboxStatus {
            messages: saturate(messages),
            unseen: saturate(unseen),
            recent: saturate(unseen),
            uid_next: max_uid.saturating_add(1),
            uid_validity: self.uid_validity(),
        })
    }

    /// Every existing UID, deleted messages included, ascending
    pub async fn uid_snapshot(&self) -> Result<Vec<u32>, MailboxError> {
        Ok(self
            .store
            .get_all_uids_including_deleted(self.inbox.id)
            .await?)
    }

    /// Resolve a sequence set against the current listing
    pub async fn resolve(
        &self,
        set: &SequenceSet,
        mode: AddressingMode,
    ) -> Result<Vec<u32>, MailboxError> {
        Ok(uid::resolve_sequence_set(self.store.as_ref(), self.inbox.id, set, mode).await?)
    }

    /// Project the addressed messages and send them to `tx` in resolved
    /// order. Messages that disappeared since resolution are skipped. Stops
    /// early without error if the receiver is dropped.
    pub async fn list_messages(
        &self,
        set: &SequenceSet,
        mode: AddressingMode,
        items: &[FetchItem],
        tx: mpsc::Sender<FetchedMessage>,
    ) -> Result<(), MailboxError> {
        let all_uids = self.uid_snapshot().await?;
        let positions: HashMap<u32, u32> = all_uids
            .iter()
            .enumerate()
            .map(|(idx, &uid)| (uid, idx as u32 + 1))
            .collect();

        let uids: Vec<u32> = uid::resolve(set, mode, &all_uids)
            .into_iter()
            .filter(|uid| positions.contains_key(uid))
            .collect();

        for chunk in uids.chunks(BATCH_SIZE) {
            let mut messages: HashMap<u32, _> = self
                .store
                .get_by_uids(self.inbox.id, chunk)
                .await?
                .into_iter()
                .map(|m| (m.uid, m))
                .collect();

            for uid in chunk {
                let (Some(message), Some(&sequence)) = (messages.remove(uid), positions.get(uid))
                else {
                    debug!(inbox = %self.inbox.email, uid, "Message vanished before fetch");
                    continue;
                };

                let fetched = FetchedMessage {
                    sequence,
                    uid: *uid,
                    values: projector::project(&message, items),
                };
                if tx.send(fetched).await.is_err() {
                    debug!(inbox = %self.inbox.email, "Fetch receiver dropped");
                    return Ok(());
                }
            }
        }

        Ok(())
    }

    /// Matching UIDs, or sequence numbers in [`AddressingMode::Sequence`],
    /// in ascending order
    pub async fn search(
        &self,
        predicate: &SearchPredicate,
        mode: AddressingMode,
    ) -> Result<Vec<u32>, MailboxError> {
        let Some(filters) = predicate.store_filters() else {
            return Ok(Vec::new());
        };

        let mut matched = Vec::new();
        let mut offset = 0;
        loop {
            let (batch, total) = self
                .store
                .list_by_inbox(self.inbox.id, filters, BATCH_SIZE, offset)
                .await?;
            let fetched = batch.len();

            matched.extend(
                batch
                    .iter()
                    .filter(|m| search::matches(m, predicate))
                    .map(|m| m.uid),
            );

            offset += fetched;
            if fetched < BATCH_SIZE || offset >= total {
                break;
            }
        }

        match mode {
            AddressingMode::Uid => Ok(matched),
            AddressingMode::Sequence => {
                let all_uids = self.uid_snapshot().await?;
                Ok(matched
                    .into_iter()
                    .filter_map(|uid| {
                        all_uids
                            .binary_search(&uid)
                            .ok()
                            .map(|idx| idx as u32 + 1)
                    })
                    .collect())
            }
        }
    }

    /// Apply a flag change to every addressed message. Each target is
    /// attempted independently; per-target failures are logged and do not
    /// fail the command. Unknown flags are ignored.
    pub async fn update_flags(
        &self,
        set: &SequenceSet,
        mode: AddressingMode,
        operation: FlagOperation,
        flags: &[String],
    ) -> Result<(), MailboxError> {
        let requested: Vec<Flag> = flags
            .iter()
            .filter_map(|name| {
                let flag = Flag::parse(name);
                if flag.is_none() {
                    debug!(flag = %name, "Ignoring unsupported flag");
                }
                flag
            })
            .collect();

        let actions = flag_actions(operation, &requested);
        if actions.is_empty() {
            return Ok(());
        }

        let targets = self.resolve(set, mode).await?;
        let mut outcome = BatchOutcome::default();

        for uid in targets {
            let id = match self.store.get_identity_for_uid(self.inbox.id, uid).await {
                Ok(Some(id)) => id,
                Ok(None) => continue,
                Err(e) => {
                    outcome.failed.push((uid, e));
                    continue;
                }
            };

            let mut result = Ok(());
            for &(flag, value) in &actions {
                result = match flag {
                    Flag::Seen => self.store.set_read(id, value).await,
                    Flag::Deleted => self.store.set_deleted(id, value).await,
                };
                if result.is_err() {
                    break;
                }
            }
            outcome.record(uid, result);
        }

        outcome.log(&self.inbox.email, "store");
        Ok(())
    }

    /// Permanently remove messages.
    ///
    /// With explicit UIDs each one is removed; otherwise every message marked
    /// deleted is removed, `BATCH_SIZE` at a time. Per-message failures are
    /// logged and skipped; only a failure to list the candidates fails the
    /// call.
    pub async fn expunge(&self, uids: Option<&[u32]>) -> Result<(), MailboxError> {
        let mut outcome = BatchOutcome::default();

        match uids {
            Some(uids) => {
                for &uid in uids {
                    match self.store.get_identity_for_uid(self.inbox.id, uid).await {
                        Ok(Some(id)) => self.remove(id, uid, &mut outcome).await,
                        Ok(None) => {}
                        Err(e) => outcome.failed.push((uid, e)),
                    }
                }
            }
            None => loop {
                // Failed messages stay in the listing ahead of the rest
                let (batch, _) = self
                    .store
                    .list_by_inbox(
                        self.inbox.id,
                        MessageFilters::deleted(),
                        BATCH_SIZE,
                        outcome.failed.len(),
                    )
                    .await?;
                let fetched = batch.len();

                for message in batch {
                    self.remove(message.id, message.uid, &mut outcome).await;
                }

                if fetched < BATCH_SIZE {
                    break;
                }
            },
        }

        info!(
            inbox = %self.inbox.email,
            removed = outcome.succeeded,
            failed = outcome.failed.len(),
            "Expunge completed"
        );
        outcome.log(&self.inbox.email, "expunge");
        Ok(())
    }

    /// Delete one message. A message another session already removed is
    /// not a failure, and keeps the paging offset of the deleted listing
    /// in step with the rows that remain.
    async fn remove(&self, id: MessageId, uid: u32, outcome: &mut BatchOutcome) {
        match self.store.delete(id).await {
            Err(e) if e.is_not_found() => {
                debug!(inbox = %self.inbox.email, uid, "Message already expunged");
            }
            result => outcome.record(uid, result),
        }
    }

    pub async fn create_message(&self) -> Result<(), MailboxError> {
        Err(MailboxError::Unsupported("APPEND"))
    }

    pub async fn copy_messages(&self, _destination: &str) -> Result<(), MailboxError> {
        Err(MailboxError::Unsupported("COPY"))
    }

    pub async fn move_messages(&self, _destination: &str) -> Result<(), MailboxError> {
        Err(MailboxError::Unsupported("MOVE"))
    }
}

/// Per-message column updates for a STORE operation
fn flag_actions(operation: FlagOperation, requested: &[Flag]) -> Vec<(Flag, bool)> {
    let mut actions = Vec::new();
    match operation {
        FlagOperation::Add => actions.extend(requested.iter().map(|&f| (f, true))),
        FlagOperation::Remove => actions.extend(requested.iter().map(|&f| (f, false))),
        FlagOperation::Set => {
            for flag in [Flag::Seen, Flag::Deleted] {
                if !requested.contains(&flag) {
                    actions.push((flag, false));
                }
            }
            actions.extend(requested.iter().map(|&f| (f, true)));
        }
    }
    actions.dedup();
    actions
}

fn saturate(count: usize) -> u32 {
    u32::try_from(count).unwrap_or(u32::MAX)
}
