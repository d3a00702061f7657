use shared::domain::MessageId;

use crate::messages::ChatMessage;

/// Pinned messages of the active conversation, most recently pinned first.
#[derive(Debug, Clone, Default)]
pub struct PinnedSet {
    entries: Vec<ChatMessage>,
}

impl PinnedSet {
    pub fn replace(&mut self, messages: impl IntoIterator<Item = ChatMessage>) {
        self.entries = messages.into_iter().filter(ChatMessage::is_pinned).collect();
        self.entries.sort_by(|a, b| pinned_at(b).cmp(&pinned_at(a)));
    }

    pub fn pin(&mut self, message: ChatMessage) {
        self.entries.retain(|m| m.id != message.id);
        self.entries.insert(0, message);
    }

    pub fn unpin(&mut self, id: &MessageId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|m| &m.id != id);
        before != self.entries.len()
    }

    /// Keeps a pinned copy in step with an edit made in the message log.
    pub fn refresh(&mut self, message: &ChatMessage) {
        if let Some(entry) = self.entries.iter_mut().find(|m| m.id == message.id) {
            entry.body = message.body.clone();
            entry.edited_at = message.edited_at;
        }
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.entries.iter().any(|m| &m.id == id)
    }

    pub fn entries(&self) -> &[ChatMessage] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

fn pinned_at(message: &ChatMessage) -> Option<chrono::DateTime<chrono::Utc>> {
    message.pin.as_ref().map(|pin| pin.pinned_at)
}
