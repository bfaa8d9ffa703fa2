use std::collections::HashMap;
use std::sync::Arc;

use uuid::Uuid;

use switchboard_types::models::{Conversation, Role, UserProfile};

use crate::backend::Backend;
use crate::directory::UserDirectory;
use crate::error::{ClientError, Result};
use crate::store::ConversationStore;

/// An end-user and their conversation, if they were ever contacted.
#[derive(Debug, Clone, PartialEq)]
pub struct RosterEntry {
    pub user: UserProfile,
    pub conversation: Option<Conversation>,
}

impl RosterEntry {
    pub fn operator_unread(&self) -> u32 {
        self.conversation
            .as_ref()
            .map(|c| c.operator_unread_count)
            .unwrap_or(0)
    }
}

/// Left join of users onto conversations. Unread first, then most recent
/// activity, then name.
pub fn join(users: Vec<UserProfile>, conversations: Vec<Conversation>) -> Vec<RosterEntry> {
    let mut by_user: HashMap<Uuid, Conversation> =
        conversations.into_iter().map(|c| (c.end_user_id, c)).collect();

    let mut entries: Vec<RosterEntry> = users
        .into_iter()
        .filter(|u| u.role == Role::EndUser)
        .map(|user| RosterEntry {
            conversation: by_user.remove(&user.id),
            user,
        })
        .collect();

    entries.sort_by(|a, b| {
        let last = |e: &RosterEntry| e.conversation.as_ref().and_then(|c| c.last_message_at);
        (b.operator_unread() > 0)
            .cmp(&(a.operator_unread() > 0))
            .then(last(b).cmp(&last(a)))
            .then_with(|| a.user.display_name.cmp(&b.user.display_name))
    });
    entries
}

/// Operator-side picker over every end-user.
pub struct Roster {
    backend: Arc<dyn Backend>,
    store: ConversationStore,
    directory: UserDirectory,
}

impl Roster {
    pub fn new(backend: Arc<dyn Backend>, store: ConversationStore, directory: UserDirectory) -> Result<Self> {
        if !store.viewer().is_operator() {
            return Err(ClientError::Forbidden);
        }
        Ok(Self { backend, store, directory })
    }

    pub async fn load(&self) -> Result<Vec<RosterEntry>> {
        let (users, conversations) = tokio::join!(
            self.backend.list_users(Some(Role::EndUser)),
            self.store.list_for_operator(),
        );
        let users = users?;
        for user in &users {
            self.directory.remember(user);
        }
        Ok(join(users, conversations?))
    }

    /// Existing conversation, or resolve one through the store.
    pub async fn select_or_create(&self, end_user_id: Uuid) -> Result<Conversation> {
        if let Some(existing) = self.store.for_end_user(end_user_id) {
            return Ok(existing);
        }
        self.store.resolve_or_create(end_user_id).await
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::*;

    fn user(name: &str, role: Role) -> UserProfile {
        UserProfile {
            id: Uuid::new_v4(),
            display_name: name.into(),
            avatar_ref: None,
            role,
            created_at: Utc::now(),
        }
    }

    fn conversation(end_user_id: Uuid, unread: u32, minutes_ago: i64) -> Conversation {
        let now = Utc::now();
        Conversation {
            id: Uuid::new_v4(),
            end_user_id,
            operator_id: None,
            last_message_at: Some(now - Duration::minutes(minutes_ago)),
            end_user_unread_count: 0,
            operator_unread_count: unread,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn left_join_keeps_uncontacted_users() {
        let ada = user("Ada", Role::EndUser);
        let bo = user("Bo", Role::EndUser);
        let cy = user("Cy", Role::EndUser);
        let op = user("Desk", Role::Operator);

        let convs = vec![conversation(bo.id, 0, 1), conversation(cy.id, 2, 30)];
        let roster = join(vec![ada.clone(), bo.clone(), cy.clone(), op], convs);

        let names: Vec<&str> = roster.iter().map(|e| e.user.display_name.as_str()).collect();
        assert_eq!(names, vec!["Cy", "Bo", "Ada"]);
        assert!(roster[2].conversation.is_none());
        assert_eq!(roster[0].operator_unread(), 2);
    }
}
