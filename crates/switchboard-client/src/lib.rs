//! Client-side real-time core: conversation state, message streams with
//! optimistic sends, unread badges, and the unified notification feed, all
//! fed by one change-notification bus.

pub mod backend;
pub mod badge;
pub mod bus;
pub mod composer;
pub mod config;
pub mod context;
pub mod directory;
pub mod error;
pub mod feed;
pub mod kv;
pub mod roster;
pub mod store;
pub mod stream;
pub mod transport;

use uuid::Uuid;

use switchboard_types::models::Role;

pub use context::ClientContext;
pub use error::{ClientError, Result};

/// Who is looking: identity and side of the signed-in participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Viewer {
    pub user_id: Uuid,
    pub role: Role,
}

impl Viewer {
    pub fn new(user_id: Uuid, role: Role) -> Self {
        Self { user_id, role }
    }

    pub fn is_operator(&self) -> bool {
        self.role == Role::Operator
    }
}
