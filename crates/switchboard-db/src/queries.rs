use anyhow::{Result, anyhow};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, ErrorCode, params};
use uuid::Uuid;

use switchboard_types::models::{
    ClearMarker, Conversation, InboxMessage, Message, Posting, Resource, Role, UserProfile,
};

use crate::Database;
use crate::models::{
    CONVERSATION_COLUMNS, MESSAGE_COLUMNS, USER_COLUMNS, clear_marker_from_row,
    conversation_from_row, format_ts, inbox_message_from_row, message_from_row,
    posting_from_row, resource_from_row, user_from_row,
};

/// Stamp for the next write to a conversation row: `now`, or one tick past
/// the stored value if the clock has not moved beyond it. Writers read `now`
/// before taking the connection, so commit order and clock order can differ;
/// this keeps `updated_at` strictly increasing in commit order.
fn next_stamp(previous: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
    now.max(previous + Duration::microseconds(1))
}

fn unread_column(role: Role) -> &'static str {
    match role {
        Role::EndUser => "end_user_unread_count",
        Role::Operator => "operator_unread_count",
    }
}

impl Database {
    // -- Users --

    /// Insert or refresh a directory entry. The directory itself is owned
    /// by the identity service; this keeps a local copy for joins.
    pub fn upsert_user(&self, user: &UserProfile) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, display_name, avatar_ref, role, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                     display_name = excluded.display_name,
                     avatar_ref = excluded.avatar_ref,
                     role = excluded.role",
                params![
                    user.id.to_string(),
                    user.display_name,
                    user.avatar_ref,
                    user.role.as_str(),
                    format_ts(user.created_at),
                ],
            )?;
            Ok(())
        })
    }

    /// Record a participant seen in a verified token, keeping any richer
    /// entry the directory already has.
    pub fn ensure_user(
        &self,
        id: Uuid,
        display_name: &str,
        role: Role,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, display_name, role, created_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO NOTHING",
                params![id.to_string(), display_name, role.as_str(), format_ts(now)],
            )?;
            Ok(())
        })
    }

    pub fn get_user(&self, id: Uuid) -> Result<Option<UserProfile>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
                [id.to_string()],
                user_from_row,
            )
            .optional()
        })
    }

    pub fn list_users(&self, role: Option<Role>) -> Result<Vec<UserProfile>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {USER_COLUMNS} FROM users
                 WHERE (?1 IS NULL OR role = ?1)
                 ORDER BY display_name COLLATE NOCASE, id"
            ))?;
            let rows = stmt
                .query_map([role.map(|r| r.as_str())], user_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    // -- Conversations --

    pub fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>> {
        self.with_conn(|conn| query_conversation(conn, id))
    }

    pub fn find_conversation_by_end_user(&self, end_user_id: Uuid) -> Result<Option<Conversation>> {
        self.with_conn(|conn| query_conversation_by_end_user(conn, end_user_id))
    }

    /// Atomic find-or-create keyed by end-user.
    /// Returns the conversation and whether this call created it.
    pub fn find_or_create_conversation(
        &self,
        id: Uuid,
        end_user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(Conversation, bool)> {
        self.with_conn(|conn| {
            if let Some(existing) = query_conversation_by_end_user(conn, end_user_id)? {
                return Ok((existing, false));
            }

            let inserted = conn.execute(
                "INSERT INTO conversations (id, end_user_id, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?3)",
                params![id.to_string(), end_user_id.to_string(), format_ts(now)],
            );

            match inserted {
                Ok(_) => {}
                Err(rusqlite::Error::SqliteFailure(e, msg))
                    if e.code == ErrorCode::ConstraintViolation =>
                {
                    // Another writer created it between lookup and insert
                    return match query_conversation_by_end_user(conn, end_user_id)? {
                        Some(existing) => Ok((existing, false)),
                        None => Err(rusqlite::Error::SqliteFailure(e, msg).into()),
                    };
                }
                Err(e) => return Err(e.into()),
            }

            let created = query_conversation(conn, id)?
                .ok_or_else(|| anyhow!("Conversation {} missing after insert", id))?;
            Ok((created, true))
        })
    }

    /// All conversations, most recently active first.
    pub fn list_conversations(&self) -> Result<Vec<Conversation>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {CONVERSATION_COLUMNS} FROM conversations
                 ORDER BY last_message_at DESC NULLS LAST, created_at DESC"
            ))?;
            let rows = stmt
                .query_map([], conversation_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Zero `reader`'s unread counter and flag every message the other side
    /// sent as read, in one transaction. The other side's counter is untouched.
    /// Returns `None` if the conversation does not exist.
    pub fn mark_conversation_read(
        &self,
        conversation_id: Uuid,
        reader: Role,
        now: DateTime<Utc>,
    ) -> Result<Option<(Conversation, Vec<Message>)>> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let cid = conversation_id.to_string();

            let Some(current) = query_conversation(&tx, conversation_id)? else {
                return Ok(None);
            };
            tx.execute(
                &format!(
                    "UPDATE conversations SET {} = 0, updated_at = ?2 WHERE id = ?1",
                    unread_column(reader)
                ),
                params![cid, format_ts(next_stamp(current.updated_at, now))],
            )?;

            // Messages from the other side: for the end-user that is anyone
            // but themselves, for the operator pool it is the end-user.
            let sender_op = match reader {
                Role::EndUser => "!=",
                Role::Operator => "=",
            };
            let read = {
                let mut stmt = tx.prepare(&format!(
                    "UPDATE messages SET is_read = 1
                     WHERE conversation_id = ?1
                       AND is_read = 0
                       AND sender_id {sender_op} (SELECT end_user_id FROM conversations WHERE id = ?1)
                     RETURNING {MESSAGE_COLUMNS}"
                ))?;
                stmt.query_map([&cid], message_from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?
            };

            let conversation = query_conversation(&tx, conversation_id)?
                .ok_or_else(|| anyhow!("Conversation {} missing after update", conversation_id))?;
            tx.commit()?;
            Ok(Some((conversation, read)))
        })
    }

    /// Bump `updated_at` without changing counters.
    pub fn touch_conversation(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<Conversation>> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let Some(current) = query_conversation(&tx, id)? else {
                return Ok(None);
            };
            let conversation = tx.query_row(
                &format!(
                    "UPDATE conversations SET updated_at = ?2 WHERE id = ?1
                     RETURNING {CONVERSATION_COLUMNS}"
                ),
                params![id.to_string(), format_ts(next_stamp(current.updated_at, now))],
                conversation_from_row,
            )?;
            tx.commit()?;
            Ok(Some(conversation))
        })
    }

    // -- Messages --

    /// Insert a message and, in the same transaction, bump `last_message_at`
    /// and increment the recipient side's unread counter. The first operator
    /// to reply becomes the conversation's operator.
    pub fn insert_message(
        &self,
        id: Uuid,
        conversation_id: Uuid,
        sender_id: Uuid,
        body: &str,
        now: DateTime<Utc>,
    ) -> Result<(Message, Conversation)> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let cid = conversation_id.to_string();
            let ts = format_ts(now);

            let conversation = query_conversation(&tx, conversation_id)?
                .ok_or_else(|| anyhow!("Conversation not found: {}", conversation_id))?;
            let stamp = format_ts(next_stamp(conversation.updated_at, now));

            tx.execute(
                "INSERT INTO messages (id, conversation_id, sender_id, body, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![id.to_string(), cid, sender_id.to_string(), body, ts],
            )?;

            match conversation.side_of(sender_id) {
                Role::EndUser => {
                    tx.execute(
                        "UPDATE conversations
                         SET operator_unread_count = operator_unread_count + 1,
                             last_message_at = ?2,
                             updated_at = ?3
                         WHERE id = ?1",
                        params![cid, ts, stamp],
                    )?;
                }
                Role::Operator => {
                    tx.execute(
                        "UPDATE conversations
                         SET end_user_unread_count = end_user_unread_count + 1,
                             operator_id = COALESCE(operator_id, ?3),
                             last_message_at = ?2,
                             updated_at = ?4
                         WHERE id = ?1",
                        params![cid, ts, sender_id.to_string(), stamp],
                    )?;
                }
            }

            let message = query_message(&tx, id)?
                .ok_or_else(|| anyhow!("Message {} missing after insert", id))?;
            let conversation = query_conversation(&tx, conversation_id)?
                .ok_or_else(|| anyhow!("Conversation {} missing after update", conversation_id))?;
            tx.commit()?;
            Ok((message, conversation))
        })
    }

    pub fn get_message(&self, id: Uuid) -> Result<Option<Message>> {
        self.with_conn(|conn| query_message(conn, id))
    }

    /// Latest `limit` messages of a conversation, oldest first.
    pub fn list_messages(&self, conversation_id: Uuid, limit: u32) -> Result<Vec<Message>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM (
                     SELECT {MESSAGE_COLUMNS}, rowid AS seq FROM messages
                     WHERE conversation_id = ?1
                     ORDER BY created_at DESC, rowid DESC
                     LIMIT ?2
                 )
                 ORDER BY created_at ASC, seq ASC"
            ))?;
            let rows = stmt
                .query_map(params![conversation_id.to_string(), limit], message_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Hard delete. An unread message no longer counts against its recipient.
    /// Returns the removed row and the conversation as it stands afterwards,
    /// or `None` if the message was already gone.
    pub fn delete_message(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<(Message, Conversation)>> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let Some(message) = query_message(&tx, id)? else {
                return Ok(None);
            };
            let conversation = query_conversation(&tx, message.conversation_id)?
                .ok_or_else(|| anyhow!("Conversation not found: {}", message.conversation_id))?;

            tx.execute("DELETE FROM messages WHERE id = ?1", [id.to_string()])?;

            if !message.is_read {
                let column = unread_column(conversation.side_of(message.sender_id).other());
                tx.execute(
                    &format!(
                        "UPDATE conversations SET {column} = MAX({column} - 1, 0), updated_at = ?2
                         WHERE id = ?1"
                    ),
                    params![
                        conversation.id.to_string(),
                        format_ts(next_stamp(conversation.updated_at, now))
                    ],
                )?;
            }

            let conversation = query_conversation(&tx, message.conversation_id)?
                .ok_or_else(|| anyhow!("Conversation {} missing after delete", message.conversation_id))?;
            tx.commit()?;
            Ok(Some((message, conversation)))
        })
    }

    /// Most recent messages received by `viewer_id`, newest first, with
    /// sender names joined in. For the operator pool that is everything
    /// end-users sent.
    pub fn recent_inbox_messages(
        &self,
        viewer_id: Uuid,
        role: Role,
        limit: u32,
    ) -> Result<Vec<InboxMessage>> {
        const SELECT: &str = "SELECT m.id, m.conversation_id, m.sender_id, m.body, m.is_read, m.created_at,
                    u.display_name
             FROM messages m
             JOIN conversations c ON c.id = m.conversation_id
             LEFT JOIN users u ON u.id = m.sender_id";

        self.with_conn(|conn| {
            let rows = match role {
                Role::EndUser => {
                    let mut stmt = conn.prepare(&format!(
                        "{SELECT}
                         WHERE c.end_user_id = ?1 AND m.sender_id != ?1
                         ORDER BY m.created_at DESC, m.rowid DESC
                         LIMIT ?2"
                    ))?;
                    stmt.query_map(params![viewer_id.to_string(), limit], inbox_message_from_row)?
                        .collect::<std::result::Result<Vec<_>, _>>()?
                }
                Role::Operator => {
                    let mut stmt = conn.prepare(&format!(
                        "{SELECT}
                         WHERE m.sender_id = c.end_user_id
                         ORDER BY m.created_at DESC, m.rowid DESC
                         LIMIT ?1"
                    ))?;
                    stmt.query_map([limit], inbox_message_from_row)?
                        .collect::<std::result::Result<Vec<_>, _>>()?
                }
            };
            Ok(rows)
        })
    }

    // -- Clear markers --

    pub fn insert_clear_marker(
        &self,
        user_id: Uuid,
        conversation_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<ClearMarker> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO clear_markers (user_id, conversation_id, cleared_at) VALUES (?1, ?2, ?3)",
                params![user_id.to_string(), conversation_id.to_string(), format_ts(now)],
            )?;
            Ok(ClearMarker {
                user_id,
                conversation_id,
                cleared_at: now,
            })
        })
    }

    /// The most recent marker is the only one that applies.
    pub fn latest_clear_marker(
        &self,
        user_id: Uuid,
        conversation_id: Uuid,
    ) -> Result<Option<ClearMarker>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT user_id, conversation_id, cleared_at FROM clear_markers
                 WHERE user_id = ?1 AND conversation_id = ?2
                 ORDER BY cleared_at DESC, rowid DESC
                 LIMIT 1",
                params![user_id.to_string(), conversation_id.to_string()],
                clear_marker_from_row,
            )
            .optional()
        })
    }

    // -- Postings & resources --

    pub fn insert_posting(
        &self,
        id: Uuid,
        title: &str,
        summary: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Posting> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO postings (id, title, summary, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![id.to_string(), title, summary, format_ts(now)],
            )?;
            Ok(Posting {
                id,
                title: title.to_string(),
                summary: summary.map(str::to_string),
                created_at: now,
            })
        })
    }

    pub fn recent_postings(&self, limit: u32) -> Result<Vec<Posting>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, title, summary, created_at FROM postings
                 ORDER BY created_at DESC, rowid DESC LIMIT ?1",
            )?;
            let rows = stmt
                .query_map([limit], posting_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn insert_resource(
        &self,
        id: Uuid,
        name: &str,
        description: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Resource> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO resources (id, name, description, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![id.to_string(), name, description, format_ts(now)],
            )?;
            Ok(Resource {
                id,
                name: name.to_string(),
                description: description.map(str::to_string),
                created_at: now,
            })
        })
    }

    pub fn recent_resources(&self, limit: u32) -> Result<Vec<Resource>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, description, created_at FROM resources
                 ORDER BY created_at DESC, rowid DESC LIMIT ?1",
            )?;
            let rows = stmt
                .query_map([limit], resource_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

fn query_conversation(conn: &Connection, id: Uuid) -> Result<Option<Conversation>> {
    conn.query_row(
        &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?1"),
        [id.to_string()],
        conversation_from_row,
    )
    .optional()
}

fn query_conversation_by_end_user(conn: &Connection, end_user_id: Uuid) -> Result<Option<Conversation>> {
    conn.query_row(
        &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE end_user_id = ?1"),
        [end_user_id.to_string()],
        conversation_from_row,
    )
    .optional()
}

fn query_message(conn: &Connection, id: Uuid) -> Result<Option<Message>> {
    conn.query_row(
        &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
        [id.to_string()],
        message_from_row,
    )
    .optional()
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::now;

    fn user(db: &Database, name: &str, role: Role) -> Uuid {
        let id = Uuid::new_v4();
        db.upsert_user(&UserProfile {
            id,
            display_name: name.to_string(),
            avatar_ref: None,
            role,
            created_at: now(),
        })
        .unwrap();
        id
    }

    fn setup() -> (Database, Uuid, Uuid, Conversation) {
        let db = Database::open_in_memory().unwrap();
        let alice = user(&db, "alice", Role::EndUser);
        let op = user(&db, "op", Role::Operator);
        let (conv, created) = db
            .find_or_create_conversation(Uuid::new_v4(), alice, now())
            .unwrap();
        assert!(created);
        (db, alice, op, conv)
    }

    #[test]
    fn find_or_create_is_idempotent() {
        let (db, alice, _op, conv) = setup();

        let (again, created) = db
            .find_or_create_conversation(Uuid::new_v4(), alice, now())
            .unwrap();
        assert!(!created);
        assert_eq!(again.id, conv.id);
        assert_eq!(db.list_conversations().unwrap().len(), 1);
    }

    #[test]
    fn insert_bumps_only_the_recipient_counter() {
        let (db, alice, op, conv) = setup();
        assert!(conv.operator_id.is_none());

        let t = now();
        let (msg, after) = db.insert_message(Uuid::new_v4(), conv.id, alice, "Hello", t).unwrap();
        assert_eq!(msg.created_at, t);
        assert_eq!(after.operator_unread_count, 1);
        assert_eq!(after.end_user_unread_count, 0);
        assert_eq!(after.last_message_at, Some(t));
        assert!(after.operator_id.is_none());

        let (_, after) = db
            .insert_message(Uuid::new_v4(), conv.id, op, "Hi there", t + Duration::seconds(1))
            .unwrap();
        assert_eq!(after.operator_unread_count, 1);
        assert_eq!(after.end_user_unread_count, 1);
        assert_eq!(after.operator_id, Some(op));
    }

    #[test]
    fn mark_read_zeroes_only_the_reader_side() {
        let (db, alice, op, conv) = setup();
        let t = now();
        db.insert_message(Uuid::new_v4(), conv.id, alice, "one", t).unwrap();
        db.insert_message(Uuid::new_v4(), conv.id, alice, "two", t + Duration::seconds(1)).unwrap();
        db.insert_message(Uuid::new_v4(), conv.id, op, "reply", t + Duration::seconds(2)).unwrap();

        let (after, read) = db
            .mark_conversation_read(conv.id, Role::Operator, t + Duration::seconds(3))
            .unwrap()
            .unwrap();
        assert_eq!(after.operator_unread_count, 0);
        assert_eq!(after.end_user_unread_count, 1);
        assert_eq!(read.len(), 2);
        assert!(read.iter().all(|m| m.sender_id == alice && m.is_read));

        let messages = db.list_messages(conv.id, 50).unwrap();
        let reply = messages.iter().find(|m| m.sender_id == op).unwrap();
        assert!(!reply.is_read);

        assert!(db.mark_conversation_read(Uuid::new_v4(), Role::Operator, now()).unwrap().is_none());
    }

    #[test]
    fn updated_at_follows_commit_order_when_clocks_disagree() {
        let (db, alice, _op, conv) = setup();
        let t0 = now();
        let (_, first) = db.insert_message(Uuid::new_v4(), conv.id, alice, "one", t0).unwrap();

        // The reader stamped later but commits before a slower writer
        let (read, _) = db
            .mark_conversation_read(conv.id, Role::Operator, t0 + Duration::milliseconds(2))
            .unwrap()
            .unwrap();
        let (_, late) = db
            .insert_message(Uuid::new_v4(), conv.id, alice, "two", t0 + Duration::milliseconds(1))
            .unwrap();

        assert!(first.updated_at < read.updated_at);
        assert!(read.updated_at < late.updated_at);
        assert_eq!(late.operator_unread_count, 1);

        let touched = db.touch_conversation(conv.id, t0).unwrap().unwrap();
        assert!(touched.updated_at > late.updated_at);

        let msg = db.list_messages(conv.id, 50).unwrap().pop().unwrap();
        let (_, after_delete) = db.delete_message(msg.id, t0).unwrap().unwrap();
        assert!(after_delete.updated_at > touched.updated_at);
        assert_eq!(after_delete.operator_unread_count, 0);
    }

    #[test]
    fn list_messages_returns_latest_window_oldest_first() {
        let (db, alice, _op, conv) = setup();
        let t = now();
        for i in 0..5 {
            db.insert_message(Uuid::new_v4(), conv.id, alice, &format!("m{}", i), t + Duration::seconds(i))
                .unwrap();
        }
        let bodies: Vec<String> = db
            .list_messages(conv.id, 3)
            .unwrap()
            .into_iter()
            .map(|m| m.body)
            .collect();
        assert_eq!(bodies, vec!["m2", "m3", "m4"]);
    }

    #[test]
    fn deleting_unread_message_releases_its_count() {
        let (db, alice, _op, conv) = setup();
        let (msg, _) = db.insert_message(Uuid::new_v4(), conv.id, alice, "oops", now()).unwrap();

        let (removed, after) = db.delete_message(msg.id, now()).unwrap().unwrap();
        assert_eq!(removed.id, msg.id);
        assert_eq!(after.operator_unread_count, 0);
        assert!(db.get_message(msg.id).unwrap().is_none());
        assert!(db.delete_message(msg.id, now()).unwrap().is_none());
    }

    #[test]
    fn latest_clear_marker_wins() {
        let (db, alice, op, conv) = setup();
        let t = now();
        db.insert_clear_marker(alice, conv.id, t).unwrap();
        db.insert_clear_marker(alice, conv.id, t + Duration::minutes(5)).unwrap();

        let marker = db.latest_clear_marker(alice, conv.id).unwrap().unwrap();
        assert_eq!(marker.cleared_at, t + Duration::minutes(5));
        assert!(db.latest_clear_marker(op, conv.id).unwrap().is_none());
    }

    #[test]
    fn inbox_excludes_own_messages() {
        let (db, alice, op, conv) = setup();
        let t = now();
        db.insert_message(Uuid::new_v4(), conv.id, alice, "from alice", t).unwrap();
        db.insert_message(Uuid::new_v4(), conv.id, op, "from op", t + Duration::seconds(1)).unwrap();

        let alice_inbox = db.recent_inbox_messages(alice, Role::EndUser, 5).unwrap();
        assert_eq!(alice_inbox.len(), 1);
        assert_eq!(alice_inbox[0].message.body, "from op");
        assert_eq!(alice_inbox[0].sender_name, "op");

        let op_inbox = db.recent_inbox_messages(op, Role::Operator, 5).unwrap();
        assert_eq!(op_inbox.len(), 1);
        assert_eq!(op_inbox[0].message.body, "from alice");
    }

    #[test]
    fn recent_sources_are_newest_first() {
        let db = Database::open_in_memory().unwrap();
        let t = now();
        db.insert_posting(Uuid::new_v4(), "older", None, t).unwrap();
        db.insert_posting(Uuid::new_v4(), "newer", Some("details"), t + Duration::seconds(1)).unwrap();
        db.insert_resource(Uuid::new_v4(), "guide", None, t).unwrap();

        let postings = db.recent_postings(5).unwrap();
        assert_eq!(postings[0].title, "newer");
        assert_eq!(postings[0].summary.as_deref(), Some("details"));
        assert_eq!(db.recent_resources(5).unwrap().len(), 1);
    }

    #[test]
    fn list_users_filters_by_role() {
        let db = Database::open_in_memory().unwrap();
        user(&db, "zed", Role::EndUser);
        user(&db, "amy", Role::EndUser);
        user(&db, "op", Role::Operator);

        let names: Vec<String> = db
            .list_users(Some(Role::EndUser))
            .unwrap()
            .into_iter()
            .map(|u| u.display_name)
            .collect();
        assert_eq!(names, vec!["amy", "zed"]);
        assert_eq!(db.list_users(None).unwrap().len(), 3);
    }
}
