use std::fmt;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::{
    domain::{ChannelId, ChannelSummary, MessageId, Role, UserId, UserProfile},
    error::GatewayError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Messages,
    MessageReactions,
    OnlineMembers,
    Channels,
    Users,
    GlobalAlerts,
}

impl Table {
    pub fn as_str(self) -> &'static str {
        match self {
            Table::Messages => "messages",
            Table::MessageReactions => "message_reactions",
            Table::OnlineMembers => "online_members",
            Table::Channels => "channels",
            Table::Users => "users",
            Table::GlobalAlerts => "global_alerts",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRow {
    pub id: MessageId,
    pub content: String,
    #[serde(default)]
    pub channel_id: Option<ChannelId>,
    #[serde(default)]
    pub recipient_id: Option<UserId>,
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    pub sent_at: DateTime<Utc>,
    #[serde(default)]
    pub reply_to_id: Option<MessageId>,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default)]
    pub pinned_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub pinned_by: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pinned_by_username: Option<String>,
    #[serde(default)]
    pub edited_at: Option<DateTime<Utc>>,
}

/// Insert payload for `messages`; the store assigns `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMessage {
    pub content: String,
    pub channel_id: Option<ChannelId>,
    pub recipient_id: Option<UserId>,
    pub user_id: UserId,
    pub username: String,
    pub sent_at: DateTime<Utc>,
    pub reply_to_id: Option<MessageId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReactionRow {
    pub message_id: MessageId,
    pub user_id: UserId,
    pub emoji: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OnlineMemberRow {
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default)]
    pub is_online: bool,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelRow {
    pub id: ChannelId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

impl From<ChannelRow> for ChannelSummary {
    fn from(row: ChannelRow) -> Self {
        Self {
            channel_id: row.id,
            name: row.name,
            description: row.description,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRow {
    pub id: UserId,
    pub username: String,
    #[serde(default)]
    pub role: Role,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

impl From<UserRow> for UserProfile {
    fn from(row: UserRow) -> Self {
        Self {
            user_id: row.id,
            username: row.username,
            role: row.role,
            avatar_url: row.avatar_url,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnouncementRow {
    pub id: String,
    pub message: String,
    #[serde(rename = "type", default = "default_announcement_kind")]
    pub kind: String,
    #[serde(default)]
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

fn default_announcement_kind() -> String {
    "info".to_string()
}

/// Payload of the `typing` and `stop_typing` broadcast events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingPayload {
    pub user_id: UserId,
    pub username: String,
}

/// Metadata a session tracks on the shared presence channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceMeta {
    pub user_id: UserId,
    pub username: String,
    pub online_at: DateTime<Utc>,
}

pub fn encode_row<T: Serialize>(row: &T) -> Result<Value, GatewayError> {
    Ok(serde_json::to_value(row)?)
}

pub fn decode_row<T: DeserializeOwned>(row: Value) -> Result<T, GatewayError> {
    Ok(serde_json::from_value(row)?)
}

pub fn decode_rows<T: DeserializeOwned>(rows: Vec<Value>) -> Result<Vec<T>, GatewayError> {
    rows.into_iter().map(decode_row).collect()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn decodes_message_row_with_missing_optional_columns() {
        let row: MessageRow = decode_row(json!({
            "id": "m-1",
            "content": "hi",
            "user_id": "alice",
            "sent_at": "2024-05-01T10:00:00Z",
        }))
        .expect("row");
        assert_eq!(row.channel_id, None);
        assert!(!row.pinned);
    }

    #[test]
    fn malformed_rows_are_rejected_as_validation_errors() {
        let err = decode_row::<MessageRow>(json!({ "id": 5 })).expect_err("must fail");
        assert_eq!(err.code, ErrorCode::Validation);
    }
}
