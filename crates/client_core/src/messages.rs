//! Ordered message collection for the active conversation, with optimistic
//! entries that are promoted in place when their realtime echo arrives.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::Serialize;
use shared::{
    domain::{ChannelId, MessageId, UserId, SYSTEM_USER_ID},
    protocol::{AnnouncementRow, MessageRow},
};

use crate::reactions::ReactionAggregate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    /// Local copy only; waiting for the realtime echo.
    Pending,
    Confirmed,
    /// The insert was rejected. The entry stays visible and can be retried.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PinInfo {
    pub pinned_at: DateTime<Utc>,
    pub pinned_by: Option<UserId>,
    pub pinned_by_username: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatMessage {
    pub id: MessageId,
    pub channel_id: Option<ChannelId>,
    pub recipient_id: Option<UserId>,
    pub author_id: UserId,
    pub author_name: Option<String>,
    pub body: String,
    pub sent_at: DateTime<Utc>,
    pub reply_to: Option<MessageId>,
    pub edited_at: Option<DateTime<Utc>>,
    pub pin: Option<PinInfo>,
    pub reactions: Vec<ReactionAggregate>,
    pub delivery: DeliveryState,
}

impl ChatMessage {
    pub fn is_pinned(&self) -> bool {
        self.pin.is_some()
    }

    pub fn is_confirmed(&self) -> bool {
        self.delivery == DeliveryState::Confirmed
    }

    pub fn from_announcement(row: AnnouncementRow, author_name: &str) -> Self {
        Self {
            id: MessageId::new(row.id),
            channel_id: None,
            recipient_id: None,
            author_id: UserId::from(SYSTEM_USER_ID),
            author_name: Some(author_name.to_string()),
            body: row.message,
            sent_at: row.created_at,
            reply_to: None,
            edited_at: None,
            pin: None,
            reactions: Vec::new(),
            delivery: DeliveryState::Confirmed,
        }
    }
}

impl From<MessageRow> for ChatMessage {
    fn from(row: MessageRow) -> Self {
        let pin = match (row.pinned, row.pinned_at) {
            (true, Some(pinned_at)) => Some(PinInfo {
                pinned_at,
                pinned_by: row.pinned_by,
                pinned_by_username: row.pinned_by_username,
            }),
            (true, None) => Some(PinInfo {
                pinned_at: row.sent_at,
                pinned_by: row.pinned_by,
                pinned_by_username: row.pinned_by_username,
            }),
            (false, _) => None,
        };
        Self {
            id: row.id,
            channel_id: row.channel_id,
            recipient_id: row.recipient_id,
            author_id: row.user_id,
            author_name: row.username,
            body: row.content,
            sent_at: row.sent_at,
            reply_to: row.reply_to_id,
            edited_at: row.edited_at,
            pin,
            reactions: Vec::new(),
            delivery: DeliveryState::Confirmed,
        }
    }
}

/// Fields of a locally composed message before it has an id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Draft {
    pub author_id: UserId,
    pub author_name: String,
    pub body: String,
    pub channel_id: Option<ChannelId>,
    pub recipient_id: Option<UserId>,
    pub reply_to: Option<MessageId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MergeOutcome {
    /// Already present under its final id; nothing changed.
    Duplicate,
    /// Replaced the optimistic entry `pending_id` at `index`.
    Promoted { pending_id: MessageId, index: usize },
    Appended { index: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PendingKey {
    author: UserId,
    body: String,
}

impl PendingKey {
    fn of(message: &ChatMessage) -> Self {
        Self {
            author: message.author_id.clone(),
            body: message.body.clone(),
        }
    }
}

#[derive(Debug)]
pub struct MessageLog {
    entries: Vec<ChatMessage>,
    ids: HashSet<MessageId>,
    pending: HashMap<PendingKey, Vec<MessageId>>,
    next_sequence: u64,
    promotion_window: chrono::Duration,
}

impl Default for MessageLog {
    fn default() -> Self {
        Self::new(chrono::Duration::seconds(10))
    }
}

impl MessageLog {
    pub fn new(promotion_window: chrono::Duration) -> Self {
        Self {
            entries: Vec::new(),
            ids: HashSet::new(),
            pending: HashMap::new(),
            next_sequence: 1,
            promotion_window,
        }
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.ids.contains(id)
    }

    pub fn get(&self, id: &MessageId) -> Option<&ChatMessage> {
        self.position(id).map(|index| &self.entries[index])
    }

    pub fn pending_count(&self) -> usize {
        self.pending.values().map(Vec::len).sum()
    }

    /// Replaces the whole collection with freshly loaded history, sorted by `sent_at`.
    pub fn replace_all(&mut self, messages: impl IntoIterator<Item = ChatMessage>) {
        self.clear();
        for message in messages {
            if self.ids.insert(message.id.clone()) {
                self.entries.push(message);
            }
        }
        self.entries.sort_by_key(|m| m.sent_at);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.ids.clear();
        self.pending.clear();
    }

    /// Appends a locally composed message under a fresh `temp-N` id.
    pub fn push_optimistic(&mut self, draft: Draft, sent_at: DateTime<Utc>) -> MessageId {
        let id = MessageId::pending(self.next_sequence);
        self.next_sequence += 1;

        let message = ChatMessage {
            id: id.clone(),
            channel_id: draft.channel_id,
            recipient_id: draft.recipient_id,
            author_id: draft.author_id,
            author_name: Some(draft.author_name),
            body: draft.body,
            sent_at,
            reply_to: draft.reply_to,
            edited_at: None,
            pin: None,
            reactions: Vec::new(),
            delivery: DeliveryState::Pending,
        };
        self.pending
            .entry(PendingKey::of(&message))
            .or_default()
            .push(id.clone());
        self.ids.insert(id.clone());
        self.entries.push(message);
        id
    }

    /// Applies a confirmed message. Idempotent: replaying the same message is a no-op.
    pub fn merge_incoming(&mut self, mut incoming: ChatMessage) -> MergeOutcome {
        if self.ids.contains(&incoming.id) {
            return MergeOutcome::Duplicate;
        }
        incoming.delivery = DeliveryState::Confirmed;

        if let Some((pending_id, index)) = self.find_promotable(&incoming) {
            let local = &self.entries[index];
            let key = PendingKey::of(local);
            if incoming.author_name.is_none() {
                incoming.author_name = local.author_name.clone();
            }
            if incoming.reply_to.is_none() {
                incoming.reply_to = local.reply_to.clone();
            }
            self.forget_pending(&key, &pending_id);
            self.ids.remove(&pending_id);
            self.ids.insert(incoming.id.clone());
            self.entries[index] = incoming;
            return MergeOutcome::Promoted { pending_id, index };
        }

        self.ids.insert(incoming.id.clone());
        self.entries.push(incoming);
        MergeOutcome::Appended {
            index: self.entries.len() - 1,
        }
    }

    /// Earliest pending or failed entry with the same author and body inside the window.
    fn find_promotable(&self, incoming: &ChatMessage) -> Option<(MessageId, usize)> {
        let candidates = self.pending.get(&PendingKey::of(incoming))?;
        candidates.iter().find_map(|candidate| {
            let index = self.position(candidate)?;
            let local = &self.entries[index];
            self.within_window(incoming.sent_at, local.sent_at)
                .then(|| (candidate.clone(), index))
        })
    }

    fn within_window(&self, a: DateTime<Utc>, b: DateTime<Utc>) -> bool {
        let delta = a - b;
        delta < self.promotion_window && -delta < self.promotion_window
    }

    /// Re-adds a pending or failed entry after a history reload, unless the reload
    /// already holds its confirmed copy.
    pub fn restore_unconfirmed(&mut self, message: ChatMessage) -> bool {
        if message.is_confirmed() || self.ids.contains(&message.id) {
            return false;
        }
        let echoed = self.entries.iter().any(|m| {
            m.is_confirmed()
                && m.author_id == message.author_id
                && m.body == message.body
                && self.within_window(m.sent_at, message.sent_at)
        });
        if echoed {
            return false;
        }
        self.pending
            .entry(PendingKey::of(&message))
            .or_default()
            .push(message.id.clone());
        self.ids.insert(message.id.clone());
        self.entries.push(message);
        true
    }

    fn forget_pending(&mut self, key: &PendingKey, id: &MessageId) {
        if let Some(ids) = self.pending.get_mut(key) {
            ids.retain(|pending| pending != id);
            if ids.is_empty() {
                self.pending.remove(key);
            }
        }
    }

    fn position(&self, id: &MessageId) -> Option<usize> {
        if !self.ids.contains(id) {
            return None;
        }
        if id.is_pending() {
            // Optimistic entries sit near the tail.
            self.entries.iter().rposition(|m| &m.id == id)
        } else {
            self.entries.iter().position(|m| &m.id == id)
        }
    }

    pub fn mark_failed(&mut self, id: &MessageId) -> bool {
        match self.position(id) {
            Some(index) if self.entries[index].delivery == DeliveryState::Pending => {
                self.entries[index].delivery = DeliveryState::Failed;
                true
            }
            _ => false,
        }
    }

    /// Moves a failed entry to the tail as pending again, stamped `now`. Returns the entry to resend.
    pub fn begin_retry(&mut self, id: &MessageId, now: DateTime<Utc>) -> Option<ChatMessage> {
        let index = self.position(id)?;
        if self.entries[index].delivery != DeliveryState::Failed {
            return None;
        }
        let mut message = self.entries.remove(index);
        message.delivery = DeliveryState::Pending;
        message.sent_at = now;
        self.entries.push(message.clone());
        Some(message)
    }

    /// Edits a confirmed entry. Unconfirmed entries are left alone.
    pub fn apply_edit(&mut self, id: &MessageId, body: String, edited_at: DateTime<Utc>) -> bool {
        let Some(index) = self.position(id) else {
            return false;
        };
        let message = &mut self.entries[index];
        if !message.is_confirmed() {
            return false;
        }
        message.body = body;
        message.edited_at = Some(edited_at);
        true
    }

    pub fn set_pin(&mut self, id: &MessageId, pin: Option<PinInfo>) -> bool {
        let Some(index) = self.position(id) else {
            return false;
        };
        self.entries[index].pin = pin;
        true
    }

    pub fn reactions_mut(&mut self, id: &MessageId) -> Option<&mut Vec<ReactionAggregate>> {
        let index = self.position(id)?;
        Some(&mut self.entries[index].reactions)
    }

    pub fn remove(&mut self, id: &MessageId) -> Option<ChatMessage> {
        let index = self.position(id)?;
        let message = self.entries.remove(index);
        self.ids.remove(id);
        if message.delivery != DeliveryState::Confirmed {
            self.forget_pending(&PendingKey::of(&message), id);
        }
        Some(message)
    }
}

#[cfg(test)]
#[path = "tests/messages_tests.rs"]
mod tests;
