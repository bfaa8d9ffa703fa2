//! Row decoding: maps SQLite rows onto switchboard-types models.
//! Ids are stored as TEXT uuids and timestamps as fixed-width RFC 3339 text
//! so that lexical order equals time order.
use chrono::{DateTime, NaiveDateTime, SecondsFormat, SubsecRound, Utc};
use rusqlite::Row;
use rusqlite::types::Type;
use uuid::Uuid;

use switchboard_types::models::{
    ClearMarker, Conversation, InboxMessage, Message, Posting, Resource, Role, UserProfile,
};

pub const USER_COLUMNS: &str = "id, display_name, avatar_ref, role, created_at";

pub const CONVERSATION_COLUMNS: &str = "id, end_user_id, operator_id, last_message_at, \
     end_user_unread_count, operator_unread_count, created_at, updated_at";

pub const MESSAGE_COLUMNS: &str = "id, conversation_id, sender_id, body, is_read, created_at";

/// Current time at storage precision, so values handed back to callers
/// compare equal to what a later read returns.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Encode a timestamp for storage.
pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Decode a stored timestamp. Also accepts SQLite's `datetime('now')` shape.
pub fn parse_ts(raw: &str) -> Option<DateTime<Utc>> {
    raw.parse::<DateTime<Utc>>().ok().or_else(|| {
        NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
            .ok()
            .map(|ndt| ndt.and_utc())
    })
}

fn conversion_error(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, msg.into())
}

fn uuid_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|e| conversion_error(idx, format!("corrupt uuid '{}': {}", raw, e)))
}

fn opt_uuid_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Uuid>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|r| {
        r.parse()
            .map_err(|e| conversion_error(idx, format!("corrupt uuid '{}': {}", r, e)))
    })
    .transpose()
}

fn ts_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_ts(&raw).ok_or_else(|| conversion_error(idx, format!("corrupt timestamp '{}'", raw)))
}

fn opt_ts_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|r| parse_ts(&r).ok_or_else(|| conversion_error(idx, format!("corrupt timestamp '{}'", r))))
        .transpose()
}

pub fn user_from_row(row: &Row<'_>) -> rusqlite::Result<UserProfile> {
    let role: String = row.get(3)?;
    Ok(UserProfile {
        id: uuid_at(row, 0)?,
        display_name: row.get(1)?,
        avatar_ref: row.get(2)?,
        role: role.parse::<Role>().map_err(|e| conversion_error(3, e))?,
        created_at: ts_at(row, 4)?,
    })
}

pub fn conversation_from_row(row: &Row<'_>) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        id: uuid_at(row, 0)?,
        end_user_id: uuid_at(row, 1)?,
        operator_id: opt_uuid_at(row, 2)?,
        last_message_at: opt_ts_at(row, 3)?,
        end_user_unread_count: row.get(4)?,
        operator_unread_count: row.get(5)?,
        created_at: ts_at(row, 6)?,
        updated_at: ts_at(row, 7)?,
    })
}

pub fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: uuid_at(row, 0)?,
        conversation_id: uuid_at(row, 1)?,
        sender_id: uuid_at(row, 2)?,
        body: row.get(3)?,
        is_read: row.get(4)?,
        created_at: ts_at(row, 5)?,
    })
}

/// Message columns followed by the sender's display name at index 6.
pub fn inbox_message_from_row(row: &Row<'_>) -> rusqlite::Result<InboxMessage> {
    Ok(InboxMessage {
        message: message_from_row(row)?,
        sender_name: row
            .get::<_, Option<String>>(6)?
            .unwrap_or_else(|| "unknown".to_string()),
    })
}

pub fn clear_marker_from_row(row: &Row<'_>) -> rusqlite::Result<ClearMarker> {
    Ok(ClearMarker {
        user_id: uuid_at(row, 0)?,
        conversation_id: uuid_at(row, 1)?,
        cleared_at: ts_at(row, 2)?,
    })
}

pub fn posting_from_row(row: &Row<'_>) -> rusqlite::Result<Posting> {
    Ok(Posting {
        id: uuid_at(row, 0)?,
        title: row.get(1)?,
        summary: row.get(2)?,
        created_at: ts_at(row, 3)?,
    })
}

pub fn resource_from_row(row: &Row<'_>) -> rusqlite::Result<Resource> {
    Ok(Resource {
        id: uuid_at(row, 0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        created_at: ts_at(row, 3)?,
    })
}
