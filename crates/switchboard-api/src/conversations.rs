use std::sync::Arc;

use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use tracing::{debug, info};
use uuid::Uuid;

use switchboard_db::models::now;
use switchboard_types::api::{Claims, ResolveConversationRequest};
use switchboard_types::events::{ChangeEvent, Row};
use switchboard_types::models::{ClearMarker, Conversation, Role};

use crate::auth::{AppState, AppStateInner};
use crate::error::ApiError;

impl AppStateInner {
    /// Make sure the caller has a directory row so messages and markers can
    /// reference it.
    pub(crate) async fn ensure_caller(self: &Arc<Self>, claims: &Claims) -> Result<(), ApiError> {
        let (id, name, role) = (claims.sub, claims.username.clone(), claims.role);
        self.blocking(move |db| db.ensure_user(id, &name, role, now())).await
    }

    /// Load a conversation the caller participates in.
    pub(crate) async fn participant_conversation(
        self: &Arc<Self>,
        claims: &Claims,
        id: Uuid,
    ) -> Result<Conversation, ApiError> {
        let conversation = self
            .blocking(move |db| db.get_conversation(id))
            .await?
            .ok_or(ApiError::NotFound)?;

        if claims.is_operator() || conversation.end_user_id == claims.sub {
            Ok(conversation)
        } else {
            Err(ApiError::Forbidden)
        }
    }

    /// Idempotent find-or-create of the end-user's single conversation.
    /// End-users may only resolve their own; operators may open any.
    pub async fn resolve_conversation(
        self: &Arc<Self>,
        claims: &Claims,
        end_user_id: Uuid,
    ) -> Result<Conversation, ApiError> {
        if !claims.is_operator() && claims.sub != end_user_id {
            return Err(ApiError::Forbidden);
        }
        self.ensure_caller(claims).await?;

        let user = self
            .blocking(move |db| db.get_user(end_user_id))
            .await?
            .ok_or(ApiError::NotFound)?;
        if user.role != Role::EndUser {
            return Err(ApiError::Invalid(format!("{} is not an end-user", end_user_id)));
        }

        let (conversation, created) = self
            .blocking(move |db| db.find_or_create_conversation(Uuid::new_v4(), end_user_id, now()))
            .await?;

        if created {
            info!("Conversation {} opened for {}", conversation.id, end_user_id);
            self.dispatcher
                .publish(ChangeEvent::insert(Row::Conversation(conversation.clone())));
        }
        Ok(conversation)
    }

    /// Operators get every conversation; an end-user gets at most their own.
    pub async fn list_conversations(self: &Arc<Self>, claims: &Claims) -> Result<Vec<Conversation>, ApiError> {
        if claims.is_operator() {
            return self.blocking(|db| db.list_conversations()).await;
        }
        let me = claims.sub;
        let own = self.blocking(move |db| db.find_conversation_by_end_user(me)).await?;
        Ok(own.into_iter().collect())
    }

    pub async fn get_conversation(self: &Arc<Self>, claims: &Claims, id: Uuid) -> Result<Conversation, ApiError> {
        self.participant_conversation(claims, id).await
    }

    /// Zero the caller's side and mark the other side's messages read.
    pub async fn mark_read(self: &Arc<Self>, claims: &Claims, id: Uuid) -> Result<Conversation, ApiError> {
        self.participant_conversation(claims, id).await?;

        let reader = claims.role;
        let (conversation, read) = self
            .blocking(move |db| db.mark_conversation_read(id, reader, now()))
            .await?
            .ok_or(ApiError::NotFound)?;

        debug!("{} marked {} read ({} messages)", claims.username, id, read.len());
        for message in read {
            self.dispatcher.publish(ChangeEvent::update(Row::Message(message)));
        }
        self.dispatcher
            .publish(ChangeEvent::update(Row::Conversation(conversation.clone())));
        Ok(conversation)
    }

    pub async fn touch_conversation(self: &Arc<Self>, claims: &Claims, id: Uuid) -> Result<Conversation, ApiError> {
        self.participant_conversation(claims, id).await?;

        let conversation = self
            .blocking(move |db| db.touch_conversation(id, now()))
            .await?
            .ok_or(ApiError::NotFound)?;
        self.dispatcher
            .publish(ChangeEvent::update(Row::Conversation(conversation.clone())));
        Ok(conversation)
    }

    /// Record a new clear marker for the caller only. Nothing is deleted and
    /// nothing is published: the other participant's view is unaffected.
    pub async fn clear_history(self: &Arc<Self>, claims: &Claims, id: Uuid) -> Result<ClearMarker, ApiError> {
        self.participant_conversation(claims, id).await?;
        self.ensure_caller(claims).await?;

        let me = claims.sub;
        let marker = self
            .blocking(move |db| db.insert_clear_marker(me, id, now()))
            .await?;
        info!("{} cleared history of {} at {}", claims.username, id, marker.cleared_at);
        Ok(marker)
    }

    pub async fn clear_marker(
        self: &Arc<Self>,
        claims: &Claims,
        id: Uuid,
    ) -> Result<Option<ClearMarker>, ApiError> {
        self.participant_conversation(claims, id).await?;
        let me = claims.sub;
        self.blocking(move |db| db.latest_clear_marker(me, id)).await
    }
}

// -- Handlers --

pub async fn resolve_conversation(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<ResolveConversationRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let conversation = state.resolve_conversation(&claims, req.end_user_id).await?;
    Ok(Json(conversation))
}

pub async fn list_conversations(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    Ok(Json(state.list_conversations(&claims).await?))
}

pub async fn get_conversation(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    Ok(Json(state.get_conversation(&claims, conversation_id).await?))
}

pub async fn mark_read(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    Ok(Json(state.mark_read(&claims, conversation_id).await?))
}

pub async fn touch_conversation(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    Ok(Json(state.touch_conversation(&claims, conversation_id).await?))
}

pub async fn clear_history(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    Ok(Json(state.clear_history(&claims, conversation_id).await?))
}

pub async fn get_clear_marker(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    Ok(Json(state.clear_marker(&claims, conversation_id).await?))
}
