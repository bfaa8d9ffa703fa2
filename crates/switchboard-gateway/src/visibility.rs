use uuid::Uuid;

use switchboard_types::events::{ChangeEvent, Row};
use switchboard_types::models::Role;

/// Per-connection visibility rule: operators see every row, end-users see
/// their own conversation, its messages, and the public feed sources.
#[derive(Debug, Clone)]
pub struct Visibility {
    user_id: Uuid,
    role: Role,
    own_conversation: Option<Uuid>,
}

impl Visibility {
    pub fn new(user_id: Uuid, role: Role) -> Self {
        Self {
            user_id,
            role,
            own_conversation: None,
        }
    }

    /// Whether `allows` would consult its lookup for this event. Lets the
    /// caller resolve the conversation off the async path beforehand.
    pub fn needs_lookup(&self, event: &ChangeEvent) -> bool {
        self.role == Role::EndUser
            && self.own_conversation.is_none()
            && matches!(event.row, Row::Message(_))
    }

    /// `lookup` resolves the end-user's conversation id the first time a
    /// message needs checking. Conversations are created lazily, so a miss
    /// is retried on the next message.
    pub fn allows<F>(&mut self, event: &ChangeEvent, lookup: F) -> bool
    where
        F: FnOnce(Uuid) -> Option<Uuid>,
    {
        if self.role == Role::Operator {
            return true;
        }

        match &event.row {
            Row::Posting(_) | Row::Resource(_) => true,
            Row::Conversation(c) => {
                if c.end_user_id == self.user_id {
                    self.own_conversation = Some(c.id);
                    true
                } else {
                    false
                }
            }
            Row::Message(m) => {
                if self.own_conversation.is_none() {
                    self.own_conversation = lookup(self.user_id);
                }
                self.own_conversation == Some(m.conversation_id)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use switchboard_types::models::{Conversation, Message, Posting};

    fn conversation(end_user_id: Uuid) -> Conversation {
        let now = Utc::now();
        Conversation {
            id: Uuid::new_v4(),
            end_user_id,
            operator_id: None,
            last_message_at: None,
            end_user_unread_count: 0,
            operator_unread_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn message(conversation_id: Uuid, sender_id: Uuid) -> ChangeEvent {
        ChangeEvent::insert(Row::Message(Message {
            id: Uuid::new_v4(),
            conversation_id,
            sender_id,
            body: "hi".into(),
            is_read: false,
            created_at: Utc::now(),
        }))
    }

    #[test]
    fn operators_see_everything() {
        let mut v = Visibility::new(Uuid::new_v4(), Role::Operator);
        let other = conversation(Uuid::new_v4());
        assert!(v.allows(&ChangeEvent::update(Row::Conversation(other.clone())), |_| None));
        assert!(v.allows(&message(other.id, other.end_user_id), |_| None));
    }

    #[test]
    fn end_users_only_see_their_own_thread() {
        let me = Uuid::new_v4();
        let mine = conversation(me);
        let theirs = conversation(Uuid::new_v4());
        let mut v = Visibility::new(me, Role::EndUser);

        assert!(v.allows(&message(mine.id, me), |_| Some(mine.id)));
        assert!(!v.allows(&message(theirs.id, theirs.end_user_id), |_| panic!("cached")));
        assert!(!v.allows(&ChangeEvent::update(Row::Conversation(theirs)), |_| None));
        assert!(v.allows(&ChangeEvent::update(Row::Conversation(mine)), |_| None));
    }

    #[test]
    fn lookup_retries_until_conversation_exists() {
        let me = Uuid::new_v4();
        let mine = conversation(me);
        let mut v = Visibility::new(me, Role::EndUser);

        assert!(!v.allows(&message(mine.id, me), |_| None));
        assert!(v.allows(&message(mine.id, me), |_| Some(mine.id)));
    }

    #[test]
    fn lookup_is_needed_only_for_uncached_messages() {
        let me = Uuid::new_v4();
        let mine = conversation(me);
        let mut v = Visibility::new(me, Role::EndUser);
        let hello = message(mine.id, me);

        assert!(v.needs_lookup(&hello));
        assert!(!v.needs_lookup(&ChangeEvent::update(Row::Conversation(mine.clone()))));
        assert!(v.allows(&hello, |_| Some(mine.id)));
        assert!(!v.needs_lookup(&hello));

        let op = Visibility::new(Uuid::new_v4(), Role::Operator);
        assert!(!op.needs_lookup(&hello));
    }

    #[test]
    fn feed_sources_are_public() {
        let mut v = Visibility::new(Uuid::new_v4(), Role::EndUser);
        let posting = ChangeEvent::insert(Row::Posting(Posting {
            id: Uuid::new_v4(),
            title: "New opening".into(),
            summary: None,
            created_at: Utc::now(),
        }));
        assert!(v.allows(&posting, |_| None));
    }
}
