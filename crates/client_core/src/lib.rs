use serde::Serialize;
use shared::domain::{Conversation, MessageId, UserProfile};

pub mod config;
pub mod conversation;
pub mod directory;
pub mod error;
pub mod messages;
pub mod permissions;
pub mod pins;
pub mod presence;
pub mod reactions;
pub mod session;
pub mod typing;

pub use config::{load_settings, load_settings_from, ClientSettings};
pub use conversation::ChatClient;
pub use error::{ChatError, ChatResult};
pub use messages::{ChatMessage, DeliveryState, MergeOutcome, MessageLog};
pub use presence::PresenceState;
pub use reactions::{ReactionAggregate, ReactionToggle};
pub use session::Session;

/// Notifications for a UI layer. Each one means "re-read the named state"; none carries
/// the full collection except the roster and typing list, which are small.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    ConversationSelected { conversation: Conversation },
    HistoryLoaded { conversation: String, messages: usize },
    MessageQueued { id: MessageId },
    MessageMerged { id: MessageId, outcome: MergeOutcome },
    MessageFailed { id: MessageId, reason: String },
    MessageUpdated { id: MessageId },
    MessageRemoved { id: MessageId },
    ReactionsChanged { message_id: MessageId },
    PinsChanged { pinned: usize },
    TypingChanged { users: Vec<String> },
    RosterUpdated { users: Vec<UserProfile> },
    Error { message: String },
}
