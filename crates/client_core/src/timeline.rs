use chrono::Utc;
use shared::{
    domain::{ChatId, MessageId, MessageKind, UserId},
    protocol::{ChatMessage, HistoryPage},
};

use crate::history::timeline_order;

/// Lifecycle provenance of a timeline entry. A pending entry was rendered
/// optimistically and still awaits its broker-confirmed twin; the
/// correlation key is `client_message_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    Pending,
    Confirmed,
}

#[derive(Debug, Clone)]
pub struct TimelineEntry {
    pub message: ChatMessage,
    pub provenance: Provenance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Empty,
    LoadingHistory,
    Ready,
}

/// Outcome of merging a confirmed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Merge {
    /// The optimistic twin was replaced in place, keeping its position.
    ResolvedPending,
    /// A new message was inserted in display order.
    Inserted,
    /// The message id was already present; nothing changed.
    Duplicate,
    /// History has not settled yet; the push is held and merged later.
    Buffered,
}

/// One room's ordered, deduplicated message state. Purely synchronous; the
/// session layer owns the locking and the network.
pub struct Timeline {
    chat_id: ChatId,
    phase: Phase,
    entries: Vec<TimelineEntry>,
    buffered: Vec<ChatMessage>,
    history_cursor: Option<i64>,
    has_more_history: bool,
}

impl Timeline {
    pub fn new(chat_id: ChatId) -> Self {
        Self {
            chat_id,
            phase: Phase::Empty,
            entries: Vec::new(),
            buffered: Vec::new(),
            history_cursor: None,
            has_more_history: false,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn entries(&self) -> &[TimelineEntry] {
        &self.entries
    }

    pub fn latest(&self) -> Option<&TimelineEntry> {
        self.entries.last()
    }

    pub fn history_cursor(&self) -> Option<i64> {
        self.history_cursor
    }

    pub fn has_more_history(&self) -> bool {
        self.has_more_history
    }

    pub fn begin_history_load(&mut self) {
        if self.phase == Phase::Empty {
            self.phase = Phase::LoadingHistory;
        }
    }

    /// Mint and insert an optimistic entry. The synthetic id is the negated
    /// wall-clock millisecond, nudged down if two sends land on the same
    /// tick, so it can never collide with a server id.
    pub fn append_pending(
        &mut self,
        sender_id: UserId,
        content: String,
        client_message_id: String,
    ) -> ChatMessage {
        let now = Utc::now();
        let mut synthetic_id = MessageId(-now.timestamp_millis());
        while self
            .entries
            .iter()
            .any(|entry| entry.message.message_id == synthetic_id)
        {
            synthetic_id = MessageId(synthetic_id.0 - 1);
        }

        let message = ChatMessage {
            message_id: synthetic_id,
            chat_id: self.chat_id,
            sender_id,
            kind: MessageKind::Text,
            content,
            created_at: now,
            client_message_id: Some(client_message_id),
        };
        self.insert_sorted(TimelineEntry {
            message: message.clone(),
            provenance: Provenance::Pending,
        });
        message
    }

    /// Roll back an optimistic entry whose send failed.
    pub fn remove_pending(&mut self, synthetic_id: MessageId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|entry| {
            !(entry.provenance == Provenance::Pending && entry.message.message_id == synthetic_id)
        });
        self.entries.len() != before
    }

    /// True once the entry carrying this correlation key has been replaced
    /// by its confirmed twin.
    pub fn is_confirmed(&self, client_message_id: &str) -> bool {
        self.entries.iter().any(|entry| {
            entry.provenance == Provenance::Confirmed
                && entry.message.client_message_id.as_deref() == Some(client_message_id)
        })
    }

    /// Merge a server-confirmed message: resolve the optimistic twin by
    /// correlation key first, then dedupe by message id, else insert in
    /// order. Pushes racing the initial history load are buffered, never
    /// dropped.
    pub fn merge_confirmed(&mut self, message: ChatMessage) -> Merge {
        if self.phase != Phase::Ready {
            self.buffered.push(message);
            return Merge::Buffered;
        }
        self.merge_settled(message)
    }

    fn merge_settled(&mut self, message: ChatMessage) -> Merge {
        if let Some(key) = message.client_message_id.clone() {
            if let Some(index) = self
                .entries
                .iter()
                .position(|entry| entry.message.client_message_id.as_deref() == Some(key.as_str()))
            {
                if self.entries[index].provenance == Provenance::Confirmed {
                    return Merge::Duplicate;
                }
                // Replace in place so the bubble keeps its on-screen slot.
                self.entries[index] = TimelineEntry {
                    message,
                    provenance: Provenance::Confirmed,
                };
                return Merge::ResolvedPending;
            }
        }

        if self
            .entries
            .iter()
            .any(|entry| entry.message.message_id == message.message_id)
        {
            return Merge::Duplicate;
        }

        self.insert_sorted(TimelineEntry {
            message,
            provenance: Provenance::Confirmed,
        });
        Merge::Inserted
    }

    /// Merge an older page and record the paging state. Returns the ids
    /// actually added, so the caller can keep the viewport anchored on the
    /// entries that were already visible.
    pub fn absorb_history(&mut self, page: HistoryPage) -> Vec<MessageId> {
        let mut prepended = Vec::new();
        for message in page.messages {
            let duplicate = self
                .entries
                .iter()
                .any(|entry| entry.message.message_id == message.message_id);
            if duplicate {
                continue;
            }
            prepended.push(message.message_id);
            self.insert_sorted(TimelineEntry {
                message,
                provenance: Provenance::Confirmed,
            });
        }
        self.history_cursor = page.next_cursor;
        self.has_more_history = page.has_more;
        prepended
    }

    /// The first history page settled: the room becomes live and any pushes
    /// that raced the load are merged now.
    pub fn finish_history(&mut self, page: HistoryPage) -> Vec<MessageId> {
        let prepended = self.absorb_history(page);
        self.phase = Phase::Ready;
        for message in std::mem::take(&mut self.buffered) {
            self.merge_settled(message);
        }
        prepended
    }

    fn insert_sorted(&mut self, entry: TimelineEntry) {
        let index = self.entries.partition_point(|existing| {
            timeline_order(&existing.message, &entry.message) != std::cmp::Ordering::Greater
        });
        self.entries.insert(index, entry);
    }
}

#[cfg(test)]
#[path = "tests/timeline_tests.rs"]
mod tests;
