use std::sync::Arc;

use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use tracing::debug;
use uuid::Uuid;

use switchboard_db::models::now;
use switchboard_types::api::{Claims, SendMessageRequest};
use switchboard_types::events::{ChangeEvent, Row};
use switchboard_types::models::Message;

use crate::auth::{AppState, AppStateInner};
use crate::error::ApiError;

/// Upper bound on a single history page.
const MAX_HISTORY: u32 = 200;

#[derive(Debug, Deserialize)]
pub struct MessageQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_limit() -> u32 {
    50
}

impl AppStateInner {
    /// Latest messages of a conversation, oldest first. Clear markers are
    /// applied by the viewer, not here.
    pub async fn list_messages(
        self: &Arc<Self>,
        claims: &Claims,
        conversation_id: Uuid,
        limit: u32,
    ) -> Result<Vec<Message>, ApiError> {
        self.participant_conversation(claims, conversation_id).await?;
        let limit = limit.min(MAX_HISTORY);
        self.blocking(move |db| db.list_messages(conversation_id, limit)).await
    }

    /// Store a message with a server-assigned timestamp, bump the recipient's
    /// counter and announce both rows.
    pub async fn send_message(
        self: &Arc<Self>,
        claims: &Claims,
        conversation_id: Uuid,
        body: &str,
    ) -> Result<Message, ApiError> {
        let body = body.trim().to_string();
        if body.is_empty() {
            return Err(ApiError::Invalid("message body is empty".into()));
        }

        self.participant_conversation(claims, conversation_id).await?;
        self.ensure_caller(claims).await?;

        let sender = claims.sub;
        let (message, conversation) = self
            .blocking(move |db| db.insert_message(Uuid::new_v4(), conversation_id, sender, &body, now()))
            .await?;

        debug!("{} sent {} in {}", claims.username, message.id, conversation_id);
        self.dispatcher
            .publish(ChangeEvent::insert(Row::Message(message.clone())));
        self.dispatcher
            .publish(ChangeEvent::update(Row::Conversation(conversation)));
        Ok(message)
    }

    /// Hard delete. End-users may delete their own messages; operators any.
    pub async fn delete_message(
        self: &Arc<Self>,
        claims: &Claims,
        conversation_id: Uuid,
        message_id: Uuid,
    ) -> Result<(), ApiError> {
        self.participant_conversation(claims, conversation_id).await?;

        let message = self
            .blocking(move |db| db.get_message(message_id))
            .await?
            .ok_or(ApiError::NotFound)?;
        if message.conversation_id != conversation_id {
            return Err(ApiError::NotFound);
        }
        if !claims.is_operator() && message.sender_id != claims.sub {
            return Err(ApiError::Forbidden);
        }

        let Some((removed, conversation)) = self
            .blocking(move |db| db.delete_message(message_id, now()))
            .await?
        else {
            // Lost a race with another delete; the outcome is the same
            return Ok(());
        };

        debug!("{} deleted {} in {}", claims.username, message_id, conversation_id);
        self.dispatcher
            .publish(ChangeEvent::delete(Row::Message(removed)));
        self.dispatcher
            .publish(ChangeEvent::update(Row::Conversation(conversation)));
        Ok(())
    }
}

// -- Handlers --

pub async fn send_message(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let message = state.send_message(&claims, conversation_id, &req.body).await?;
    Ok((StatusCode::CREATED, Json(message)))
}

pub async fn get_messages(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Query(query): Query<MessageQuery>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let messages = state.list_messages(&claims, conversation_id, query.limit).await?;
    Ok(Json(messages))
}

pub async fn delete_message(
    State(state): State<AppState>,
    Path((conversation_id, message_id)): Path<(Uuid, Uuid)>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    state.delete_message(&claims, conversation_id, message_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
