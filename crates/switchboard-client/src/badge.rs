//! Unread indicators. Pure derivations, recomputed whenever counters or
//! thresholds change.

use chrono::{DateTime, Utc};

use switchboard_types::models::{Conversation, Role};

/// Sum of the counters belonging to `role`.
pub fn unread_total<'a>(conversations: impl IntoIterator<Item = &'a Conversation>, role: Role) -> u64 {
    conversations
        .into_iter()
        .map(|c| u64::from(c.unread_for(role)))
        .sum()
}

pub fn has_unread<'a>(conversations: impl IntoIterator<Item = &'a Conversation>, role: Role) -> bool {
    unread_total(conversations, role) > 0
}

/// Feed badge: anything strictly newer than the threshold is unseen.
pub fn has_unseen(timestamps: impl IntoIterator<Item = DateTime<Utc>>, threshold: Option<DateTime<Utc>>) -> bool {
    timestamps
        .into_iter()
        .any(|at| threshold.is_none_or(|t| at > t))
}
