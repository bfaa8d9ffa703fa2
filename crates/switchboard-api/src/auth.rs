use std::sync::Arc;

use anyhow::anyhow;
use jsonwebtoken::{EncodingKey, Header, encode};
use tracing::error;
use uuid::Uuid;

use switchboard_db::Database;
use switchboard_gateway::dispatcher::Dispatcher;
use switchboard_types::api::Claims;
use switchboard_types::models::Role;

use crate::error::ApiError;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Arc<Database>,
    pub dispatcher: Dispatcher,
    pub jwt_secret: String,
}

impl AppStateInner {
    pub fn new(db: Database, jwt_secret: String) -> AppState {
        Arc::new(Self {
            db: Arc::new(db),
            dispatcher: Dispatcher::new(),
            jwt_secret,
        })
    }

    /// Run blocking DB work off the async runtime.
    pub(crate) async fn blocking<F, T>(self: &Arc<Self>, f: F) -> Result<T, ApiError>
    where
        F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| {
                error!("spawn_blocking join error: {}", e);
                ApiError::Internal(anyhow!("blocking task failed: {}", e))
            })?
            .map_err(ApiError::from)
    }
}

pub(crate) fn require_operator(claims: &Claims) -> Result<(), ApiError> {
    if claims.is_operator() {
        Ok(())
    } else {
        Err(ApiError::Forbidden)
    }
}

/// Mint a session token. Login itself lives in the identity service; this
/// is what it (and the test suites) use to hand out gateway/API credentials.
pub fn create_token(secret: &str, user_id: Uuid, username: &str, role: Role) -> anyhow::Result<String> {
    let claims = Claims {
        sub: user_id,
        username: username.to_string(),
        role,
        exp: (chrono::Utc::now() + chrono::Duration::days(30)).timestamp() as usize,
    };

    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?;

    Ok(token)
}
