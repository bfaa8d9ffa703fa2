use std::sync::Arc;

use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use uuid::Uuid;

use switchboard_types::api::Claims;
use switchboard_types::models::{Role, UserProfile};

use crate::auth::{AppState, AppStateInner, require_operator};
use crate::error::ApiError;

#[derive(Debug, Deserialize)]
pub struct UserQuery {
    pub role: Option<Role>,
}

impl AppStateInner {
    /// Directory listing; operators only.
    pub async fn list_users(
        self: &Arc<Self>,
        claims: &Claims,
        role: Option<Role>,
    ) -> Result<Vec<UserProfile>, ApiError> {
        require_operator(claims)?;
        self.blocking(move |db| db.list_users(role)).await
    }

    /// Single directory lookup, used to put names and avatars on senders.
    pub async fn get_user(self: &Arc<Self>, _claims: &Claims, id: Uuid) -> Result<UserProfile, ApiError> {
        self.blocking(move |db| db.get_user(id))
            .await?
            .ok_or(ApiError::NotFound)
    }
}

pub async fn list_users(
    State(state): State<AppState>,
    Query(query): Query<UserQuery>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    Ok(Json(state.list_users(&claims, query.role).await?))
}

pub async fn get_user(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    Ok(Json(state.get_user(&claims, user_id).await?))
}
