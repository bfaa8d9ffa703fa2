use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Conversation, Message, Posting, Resource, Role};

/// Table a change originates from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Conversations,
    Messages,
    Postings,
    Resources,
}

/// Row payload of a change, shaped like the relational store's row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "table", content = "row", rename_all = "snake_case")]
pub enum Row {
    Conversation(Conversation),
    Message(Message),
    Posting(Posting),
    Resource(Resource),
}

impl Row {
    pub fn source(&self) -> SourceKind {
        match self {
            Self::Conversation(_) => SourceKind::Conversations,
            Self::Message(_) => SourceKind::Messages,
            Self::Posting(_) => SourceKind::Postings,
            Self::Resource(_) => SourceKind::Resources,
        }
    }

    /// Value of a filterable column, if the row has it.
    pub fn column(&self, column: Column) -> Option<Uuid> {
        match (self, column) {
            (Self::Conversation(c), Column::Id) => Some(c.id),
            (Self::Conversation(c), Column::EndUserId) => Some(c.end_user_id),
            (Self::Message(m), Column::Id) => Some(m.id),
            (Self::Message(m), Column::ConversationId) => Some(m.conversation_id),
            (Self::Message(m), Column::SenderId) => Some(m.sender_id),
            (Self::Posting(p), Column::Id) => Some(p.id),
            (Self::Resource(r), Column::Id) => Some(r.id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Column {
    Id,
    ConversationId,
    EndUserId,
    SenderId,
}

/// Row filter attached to a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Filter {
    All,
    Eq { column: Column, value: Uuid },
}

impl Filter {
    pub fn eq(column: Column, value: Uuid) -> Self {
        Self::Eq { column, value }
    }

    pub fn matches(&self, row: &Row) -> bool {
        match self {
            Self::All => true,
            Self::Eq { column, value } => row.column(*column) == Some(*value),
        }
    }
}

/// One logical channel: a source kind narrowed by a filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Topic {
    pub source: SourceKind,
    pub filter: Filter,
}

impl Topic {
    pub fn new(source: SourceKind, filter: Filter) -> Self {
        Self { source, filter }
    }

    pub fn matches(&self, event: &ChangeEvent) -> bool {
        event.row.source() == self.source && self.filter.matches(&event.row)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// An insert/update/delete notification. Deletes carry the row as it was
/// before removal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub row: Row,
}

impl ChangeEvent {
    pub fn insert(row: Row) -> Self {
        Self { kind: ChangeKind::Insert, row }
    }

    pub fn update(row: Row) -> Self {
        Self { kind: ChangeKind::Update, row }
    }

    pub fn delete(row: Row) -> Self {
        Self { kind: ChangeKind::Delete, row }
    }

    /// Conversation this change belongs to, if it is conversation-scoped.
    pub fn conversation_id(&self) -> Option<Uuid> {
        match &self.row {
            Row::Conversation(c) => Some(c.id),
            Row::Message(m) => Some(m.conversation_id),
            _ => None,
        }
    }
}

/// Events sent over the WebSocket gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayEvent {
    /// Server confirms successful authentication
    Ready { user_id: Uuid, role: Role },

    /// A topic is now open on this connection
    Subscribed { topic: Topic },

    /// A row changed in the relational store
    Change(ChangeEvent),
}

/// Commands sent FROM client TO server over WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayCommand {
    /// Authenticate the WebSocket connection
    Identify { token: String },

    /// Open a topic. Repeated subscribes to the same topic are idempotent.
    Subscribe { topic: Topic },

    /// Close a topic
    Unsubscribe { topic: Topic },
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn message(conversation_id: Uuid) -> Message {
        Message {
            id: Uuid::new_v4(),
            conversation_id,
            sender_id: Uuid::new_v4(),
            body: "hi".into(),
            is_read: false,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn topic_matches_source_and_filter() {
        let conv = Uuid::new_v4();
        let event = ChangeEvent::insert(Row::Message(message(conv)));

        let exact = Topic::new(SourceKind::Messages, Filter::eq(Column::ConversationId, conv));
        let other = Topic::new(SourceKind::Messages, Filter::eq(Column::ConversationId, Uuid::new_v4()));
        let wrong_source = Topic::new(SourceKind::Postings, Filter::All);

        assert!(exact.matches(&event));
        assert!(!other.matches(&event));
        assert!(!wrong_source.matches(&event));
        assert!(Topic::new(SourceKind::Messages, Filter::All).matches(&event));
    }

    #[test]
    fn filter_on_missing_column_never_matches() {
        let event = ChangeEvent::insert(Row::Message(message(Uuid::new_v4())));
        let topic = Topic::new(SourceKind::Messages, Filter::eq(Column::EndUserId, Uuid::new_v4()));
        assert!(!topic.matches(&event));
    }

    #[test]
    fn gateway_frames_are_adjacently_tagged() {
        let conv = Uuid::new_v4();
        let frame = GatewayEvent::Change(ChangeEvent::delete(Row::Message(message(conv))));
        let json = serde_json::to_value(&frame).unwrap();

        assert_eq!(json["type"], "Change");
        assert_eq!(json["data"]["kind"], "delete");
        assert_eq!(json["data"]["row"]["table"], "message");

        let back: GatewayEvent = serde_json::from_value(json).unwrap();
        match back {
            GatewayEvent::Change(event) => assert_eq!(event.conversation_id(), Some(conv)),
            other => panic!("unexpected frame {:?}", other),
        }
    }
}
