use std::sync::Arc;

use axum::{
    Extension, Json,
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use switchboard_db::models::now;
use switchboard_types::api::{Claims, CreatePostingRequest, CreateResourceRequest};
use switchboard_types::events::{ChangeEvent, Row};
use switchboard_types::models::{InboxMessage, Posting, Resource};

use crate::auth::{AppState, AppStateInner, require_operator};
use crate::error::ApiError;

/// Feed sources only ever need a short window.
const MAX_FEED_WINDOW: u32 = 50;

#[derive(Debug, Deserialize)]
pub struct FeedQuery {
    #[serde(default = "default_window")]
    pub limit: u32,
}

fn default_window() -> u32 {
    5
}

impl AppStateInner {
    pub async fn recent_postings(self: &Arc<Self>, limit: u32) -> Result<Vec<Posting>, ApiError> {
        let limit = limit.min(MAX_FEED_WINDOW);
        self.blocking(move |db| db.recent_postings(limit)).await
    }

    pub async fn recent_resources(self: &Arc<Self>, limit: u32) -> Result<Vec<Resource>, ApiError> {
        let limit = limit.min(MAX_FEED_WINDOW);
        self.blocking(move |db| db.recent_resources(limit)).await
    }

    /// Messages the caller received, newest first.
    pub async fn recent_inbox(self: &Arc<Self>, claims: &Claims, limit: u32) -> Result<Vec<InboxMessage>, ApiError> {
        let limit = limit.min(MAX_FEED_WINDOW);
        let (me, role) = (claims.sub, claims.role);
        self.blocking(move |db| db.recent_inbox_messages(me, role, limit)).await
    }

    pub async fn create_posting(
        self: &Arc<Self>,
        claims: &Claims,
        title: &str,
        summary: Option<String>,
    ) -> Result<Posting, ApiError> {
        require_operator(claims)?;
        let title = title.trim().to_string();
        if title.is_empty() {
            return Err(ApiError::Invalid("posting title is empty".into()));
        }

        let posting = self
            .blocking(move |db| db.insert_posting(Uuid::new_v4(), &title, summary.as_deref(), now()))
            .await?;
        info!("Posting {} created by {}", posting.id, claims.username);
        self.dispatcher
            .publish(ChangeEvent::insert(Row::Posting(posting.clone())));
        Ok(posting)
    }

    pub async fn create_resource(
        self: &Arc<Self>,
        claims: &Claims,
        name: &str,
        description: Option<String>,
    ) -> Result<Resource, ApiError> {
        require_operator(claims)?;
        let name = name.trim().to_string();
        if name.is_empty() {
            return Err(ApiError::Invalid("resource name is empty".into()));
        }

        let resource = self
            .blocking(move |db| db.insert_resource(Uuid::new_v4(), &name, description.as_deref(), now()))
            .await?;
        info!("Resource {} added by {}", resource.id, claims.username);
        self.dispatcher
            .publish(ChangeEvent::insert(Row::Resource(resource.clone())));
        Ok(resource)
    }
}

// -- Handlers --

pub async fn recent_postings(
    State(state): State<AppState>,
    Query(query): Query<FeedQuery>,
    Extension(_claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    Ok(Json(state.recent_postings(query.limit).await?))
}

pub async fn recent_resources(
    State(state): State<AppState>,
    Query(query): Query<FeedQuery>,
    Extension(_claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    Ok(Json(state.recent_resources(query.limit).await?))
}

pub async fn recent_inbox(
    State(state): State<AppState>,
    Query(query): Query<FeedQuery>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    Ok(Json(state.recent_inbox(&claims, query.limit).await?))
}

pub async fn create_posting(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreatePostingRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let posting = state.create_posting(&claims, &req.title, req.summary).await?;
    Ok((StatusCode::CREATED, Json(posting)))
}

pub async fn create_resource(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateResourceRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let resource = state.create_resource(&claims, &req.name, req.description).await?;
    Ok((StatusCode::CREATED, Json(resource)))
}
