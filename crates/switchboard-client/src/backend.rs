use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::json;
use uuid::Uuid;

use switchboard_types::models::{
    ClearMarker, Conversation, InboxMessage, Message, Posting, Resource, Role, UserProfile,
};

use crate::error::{ClientError, Result};

/// Authoritative operations the core calls into. Every call acts on behalf
/// of the signed-in viewer.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Atomic find-or-create of the end-user's conversation.
    async fn resolve_conversation(&self, end_user_id: Uuid) -> Result<Conversation>;
    async fn list_conversations(&self) -> Result<Vec<Conversation>>;
    async fn get_conversation(&self, id: Uuid) -> Result<Conversation>;
    /// Zero the viewer's counter and mark the other side's messages read.
    async fn mark_read(&self, id: Uuid) -> Result<Conversation>;
    async fn touch_conversation(&self, id: Uuid) -> Result<Conversation>;

    async fn list_messages(&self, conversation_id: Uuid, limit: u32) -> Result<Vec<Message>>;
    async fn send_message(&self, conversation_id: Uuid, body: &str) -> Result<Message>;
    async fn delete_message(&self, conversation_id: Uuid, message_id: Uuid) -> Result<()>;

    async fn clear_history(&self, conversation_id: Uuid) -> Result<ClearMarker>;
    async fn clear_marker(&self, conversation_id: Uuid) -> Result<Option<ClearMarker>>;

    async fn list_users(&self, role: Option<Role>) -> Result<Vec<UserProfile>>;
    async fn get_user(&self, id: Uuid) -> Result<UserProfile>;

    async fn recent_postings(&self, limit: u32) -> Result<Vec<Posting>>;
    async fn recent_resources(&self, limit: u32) -> Result<Vec<Resource>>;
    async fn recent_inbox(&self, limit: u32) -> Result<Vec<InboxMessage>>;
}

/// `Backend` over the switchboard HTTP API.
pub struct HttpBackend {
    client: Client,
    base_url: String,
    token: String,
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    fn get(&self, path: &str) -> RequestBuilder {
        self.client
            .get(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.token)
    }

    fn post(&self, path: &str) -> RequestBuilder {
        self.client
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.token)
    }

    async fn fetch<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T> {
        let resp = check(req.send().await?).await?;
        let bytes = resp.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Map error statuses onto the client taxonomy.
async fn check(resp: reqwest::Response) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    Err(match status {
        StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED => ClientError::Forbidden,
        StatusCode::NOT_FOUND => ClientError::NotFound,
        StatusCode::CONFLICT => ClientError::Conflict,
        other => {
            let body = resp.text().await.unwrap_or_default();
            ClientError::Backend(format!("{}: {}", other, body.chars().take(200).collect::<String>()))
        }
    })
}

#[async_trait]
impl Backend for HttpBackend {
    async fn resolve_conversation(&self, end_user_id: Uuid) -> Result<Conversation> {
        self.fetch(
            self.post("/conversations/resolve")
                .json(&json!({ "end_user_id": end_user_id })),
        )
        .await
    }

    async fn list_conversations(&self) -> Result<Vec<Conversation>> {
        self.fetch(self.get("/conversations")).await
    }

    async fn get_conversation(&self, id: Uuid) -> Result<Conversation> {
        self.fetch(self.get(&format!("/conversations/{}", id))).await
    }

    async fn mark_read(&self, id: Uuid) -> Result<Conversation> {
        self.fetch(self.post(&format!("/conversations/{}/read", id))).await
    }

    async fn touch_conversation(&self, id: Uuid) -> Result<Conversation> {
        self.fetch(self.post(&format!("/conversations/{}/touch", id))).await
    }

    async fn list_messages(&self, conversation_id: Uuid, limit: u32) -> Result<Vec<Message>> {
        self.fetch(
            self.get(&format!("/conversations/{}/messages", conversation_id))
                .query(&[("limit", limit)]),
        )
        .await
    }

    async fn send_message(&self, conversation_id: Uuid, body: &str) -> Result<Message> {
        self.fetch(
            self.post(&format!("/conversations/{}/messages", conversation_id))
                .json(&json!({ "body": body })),
        )
        .await
    }

    async fn delete_message(&self, conversation_id: Uuid, message_id: Uuid) -> Result<()> {
        let req = self
            .client
            .delete(format!(
                "{}/conversations/{}/messages/{}",
                self.base_url, conversation_id, message_id
            ))
            .bearer_auth(&self.token);
        check(req.send().await?).await?;
        Ok(())
    }

    async fn clear_history(&self, conversation_id: Uuid) -> Result<ClearMarker> {
        self.fetch(self.post(&format!("/conversations/{}/clear", conversation_id)))
            .await
    }

    async fn clear_marker(&self, conversation_id: Uuid) -> Result<Option<ClearMarker>> {
        self.fetch(self.get(&format!("/conversations/{}/clear", conversation_id)))
            .await
    }

    async fn list_users(&self, role: Option<Role>) -> Result<Vec<UserProfile>> {
        let mut req = self.get("/users");
        if let Some(role) = role {
            req = req.query(&[("role", role.as_str())]);
        }
        self.fetch(req).await
    }

    async fn get_user(&self, id: Uuid) -> Result<UserProfile> {
        self.fetch(self.get(&format!("/users/{}", id))).await
    }

    async fn recent_postings(&self, limit: u32) -> Result<Vec<Posting>> {
        self.fetch(self.get("/feed/postings").query(&[("limit", limit)]))
            .await
    }

    async fn recent_resources(&self, limit: u32) -> Result<Vec<Resource>> {
        self.fetch(self.get("/feed/resources").query(&[("limit", limit)]))
            .await
    }

    async fn recent_inbox(&self, limit: u32) -> Result<Vec<InboxMessage>> {
        self.fetch(self.get("/feed/messages").query(&[("limit", limit)]))
            .await
    }
}
