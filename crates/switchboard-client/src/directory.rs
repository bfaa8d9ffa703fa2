use std::sync::Arc;
use std::time::Duration;

use tracing::warn;
use uuid::Uuid;

use switchboard_types::models::UserProfile;

use crate::backend::Backend;
use crate::kv::KvStore;

const PREFIX: &str = "directory:";

/// Display names and avatar refs, cached in the viewer's key-value store.
/// One instance per client, handed to whoever needs names.
#[derive(Clone)]
pub struct UserDirectory {
    backend: Arc<dyn Backend>,
    kv: Arc<KvStore>,
    ttl: Duration,
}

impl UserDirectory {
    pub fn new(backend: Arc<dyn Backend>, kv: Arc<KvStore>, ttl: Duration) -> Self {
        Self { backend, kv, ttl }
    }

    pub async fn profile(&self, id: Uuid) -> Option<UserProfile> {
        let key = format!("{PREFIX}{id}");
        if let Some(profile) = self.kv.get::<UserProfile>(&key) {
            return Some(profile);
        }

        match self.backend.get_user(id).await {
            Ok(profile) => {
                self.remember(&profile);
                Some(profile)
            }
            Err(e) => {
                warn!("Directory lookup for {} failed: {}", id, e);
                None
            }
        }
    }

    pub async fn display_name(&self, id: Uuid) -> String {
        self.profile(id)
            .await
            .map(|p| p.display_name)
            .unwrap_or_else(|| "Unknown".to_string())
    }

    /// Seed the cache from a listing that already carried the profile.
    pub fn remember(&self, profile: &UserProfile) {
        self.kv
            .set_with_ttl(&format!("{PREFIX}{}", profile.id), profile, self.ttl);
    }

    pub fn invalidate(&self, id: Uuid) {
        self.kv.invalidate(&format!("{PREFIX}{id}"));
    }

    pub fn invalidate_all(&self) {
        self.kv.invalidate_prefix(PREFIX);
    }
}
