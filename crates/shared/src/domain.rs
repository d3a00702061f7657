use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(ChannelId);
id_newtype!(MessageId);

/// Prefix carried by client-generated message ids until the remote insert is observed.
pub const PENDING_MESSAGE_PREFIX: &str = "temp-";

impl MessageId {
    pub fn pending(sequence: u64) -> Self {
        Self(format!("{PENDING_MESSAGE_PREFIX}{sequence}"))
    }

    pub fn is_pending(&self) -> bool {
        self.0.starts_with(PENDING_MESSAGE_PREFIX)
    }
}

/// Author id used for announcement entries.
pub const SYSTEM_USER_ID: &str = "system";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    #[serde(alias = "owner")]
    Admin,
    Moderator,
    #[default]
    #[serde(other)]
    User,
}

impl Role {
    pub fn rank(self) -> u8 {
        match self {
            Role::Admin => 3,
            Role::Moderator => 2,
            Role::User => 1,
        }
    }

    pub fn is_elevated(self) -> bool {
        matches!(self, Role::Admin | Role::Moderator)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Moderator => "moderator",
            Role::User => "user",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: UserId,
    pub username: String,
    #[serde(default)]
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSummary {
    pub channel_id: ChannelId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Two participants of a direct conversation. `local` is the viewing user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DirectPair {
    pub local: UserId,
    pub peer: UserId,
}

impl DirectPair {
    pub fn new(local: UserId, peer: UserId) -> Self {
        Self { local, peer }
    }

    /// True when a row sent by `sender` to `recipient` belongs to this pair, in either direction.
    pub fn contains(&self, sender: &UserId, recipient: &UserId) -> bool {
        (sender == &self.local && recipient == &self.peer)
            || (sender == &self.peer && recipient == &self.local)
    }

    /// Order-independent key so both participants derive the same transport names.
    pub fn key(&self) -> String {
        let (low, high) = if self.local <= self.peer {
            (&self.local, &self.peer)
        } else {
            (&self.peer, &self.local)
        };
        format!("{low}-{high}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Conversation {
    Channel(ChannelSummary),
    Direct(DirectPair),
    Announcements,
}

impl Conversation {
    pub fn key(&self) -> String {
        match self {
            Conversation::Channel(channel) => format!("channel:{}", channel.channel_id),
            Conversation::Direct(pair) => format!("dm:{}", pair.key()),
            Conversation::Announcements => "announcements".to_string(),
        }
    }

    pub fn channel(&self) -> Option<&ChannelSummary> {
        match self {
            Conversation::Channel(channel) => Some(channel),
            _ => None,
        }
    }
}

impl fmt::Display for Conversation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}
