use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which side of a conversation a participant sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    EndUser,
    Operator,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EndUser => "end_user",
            Self::Operator => "operator",
        }
    }

    /// The side that receives what this side sends.
    pub fn other(&self) -> Self {
        match self {
            Self::EndUser => Self::Operator,
            Self::Operator => Self::EndUser,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "end_user" => Ok(Self::EndUser),
            "operator" => Ok(Self::Operator),
            other => Err(format!("unknown role '{}'", other)),
        }
    }
}

/// Directory entry for a participant, as shown next to messages and in the roster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: Uuid,
    pub display_name: String,
    pub avatar_ref: Option<String>,
    pub role: Role,
    pub created_at: DateTime<Utc>,
}

/// The single thread between one end-user and the operator pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub end_user_id: Uuid,
    /// Unset until the first operator reply.
    pub operator_id: Option<Uuid>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub end_user_unread_count: u32,
    pub operator_unread_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    /// Unread counter as seen by `role`.
    pub fn unread_for(&self, role: Role) -> u32 {
        match role {
            Role::EndUser => self.end_user_unread_count,
            Role::Operator => self.operator_unread_count,
        }
    }

    /// Set the counter belonging to `role`, leaving the other side alone.
    pub fn set_unread(&mut self, role: Role, count: u32) {
        match role {
            Role::EndUser => self.end_user_unread_count = count,
            Role::Operator => self.operator_unread_count = count,
        }
    }

    pub fn zero_unread(&mut self, role: Role) {
        self.set_unread(role, 0);
    }

    /// Side a given sender belongs to. Anyone who is not the end-user is the operator pool.
    pub fn side_of(&self, user_id: Uuid) -> Role {
        if user_id == self.end_user_id {
            Role::EndUser
        } else {
            Role::Operator
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub body: String,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

/// Per-viewer "clear history" point. Messages at or before `cleared_at`
/// are hidden from `user_id` only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClearMarker {
    pub user_id: Uuid,
    pub conversation_id: Uuid,
    pub cleared_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Posting {
    pub id: Uuid,
    pub title: String,
    pub summary: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A message received by the viewer, with the sender's display name resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboxMessage {
    pub message: Message,
    pub sender_name: String,
}
