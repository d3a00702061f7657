use std::collections::HashMap;

use serde::Serialize;
use shared::{
    domain::{MessageId, UserId},
    protocol::ReactionRow,
};

pub const UNKNOWN_USERNAME: &str = "Unknown";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reactor {
    pub user_id: UserId,
    pub username: String,
}

/// Per-emoji reactors on one message. The count is the reactor set size, so it can never drift.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReactionAggregate {
    emoji: String,
    reactors: Vec<Reactor>,
}

impl ReactionAggregate {
    pub fn new(emoji: impl Into<String>) -> Self {
        Self {
            emoji: emoji.into(),
            reactors: Vec::new(),
        }
    }

    pub fn emoji(&self) -> &str {
        &self.emoji
    }

    pub fn count(&self) -> usize {
        self.reactors.len()
    }

    pub fn has_reacted(&self, user_id: &UserId) -> bool {
        self.reactors.iter().any(|r| &r.user_id == user_id)
    }

    pub fn user_ids(&self) -> impl Iterator<Item = &UserId> {
        self.reactors.iter().map(|r| &r.user_id)
    }

    pub fn usernames(&self) -> impl Iterator<Item = &str> {
        self.reactors.iter().map(|r| r.username.as_str())
    }

    fn add(&mut self, reactor: Reactor) -> bool {
        if self.has_reacted(&reactor.user_id) {
            return false;
        }
        self.reactors.push(reactor);
        true
    }

    fn remove(&mut self, user_id: &UserId) -> bool {
        let before = self.reactors.len();
        self.reactors.retain(|r| &r.user_id != user_id);
        before != self.reactors.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReactionToggle {
    Added,
    Removed,
}

/// Flips `reactor`'s `emoji` reaction, pruning the aggregate when its last reactor leaves.
pub fn toggle_reaction(
    aggregates: &mut Vec<ReactionAggregate>,
    emoji: &str,
    reactor: Reactor,
) -> ReactionToggle {
    if let Some(index) = aggregates
        .iter()
        .position(|a| a.emoji == emoji && a.has_reacted(&reactor.user_id))
    {
        aggregates[index].remove(&reactor.user_id);
        if aggregates[index].count() == 0 {
            aggregates.remove(index);
        }
        return ReactionToggle::Removed;
    }

    match aggregates.iter_mut().find(|a| a.emoji == emoji) {
        Some(aggregate) => {
            aggregate.add(reactor);
        }
        None => {
            let mut aggregate = ReactionAggregate::new(emoji);
            aggregate.add(reactor);
            aggregates.push(aggregate);
        }
    }
    ReactionToggle::Added
}

/// Groups raw reaction rows by message, then by emoji in first-seen order.
pub fn fold_reaction_rows(
    rows: impl IntoIterator<Item = ReactionRow>,
    usernames: &HashMap<UserId, String>,
) -> HashMap<MessageId, Vec<ReactionAggregate>> {
    let mut folded: HashMap<MessageId, Vec<ReactionAggregate>> = HashMap::new();
    for row in rows {
        let aggregates = folded.entry(row.message_id).or_default();
        let username = usernames
            .get(&row.user_id)
            .cloned()
            .unwrap_or_else(|| UNKNOWN_USERNAME.to_string());
        let reactor = Reactor {
            user_id: row.user_id,
            username,
        };
        match aggregates.iter_mut().find(|a| a.emoji == row.emoji) {
            Some(aggregate) => {
                aggregate.add(reactor);
            }
            None => {
                let mut aggregate = ReactionAggregate::new(row.emoji);
                aggregate.add(reactor);
                aggregates.push(aggregate);
            }
        }
    }
    folded
}
