use std::path::PathBuf;
use std::time::Duration;

use crate::error::{ClientError, Result};

/// Message stream tuning.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Max distance between an optimistic entry and a confirmed message for
    /// the two to be treated as the same send.
    pub duplicate_tolerance: chrono::Duration,
    pub history_limit: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            duplicate_tolerance: chrono::Duration::seconds(5),
            history_limit: 50,
        }
    }
}

/// Notification feed tuning.
#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub per_source: u32,
    pub cap: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self { per_source: 5, cap: 8 }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub api_url: String,
    pub gateway_url: String,
    pub token: String,
    pub state_path: PathBuf,
    pub directory_ttl: Duration,
    pub stream: StreamConfig,
    pub feed: FeedConfig,
}

impl ClientConfig {
    pub fn new(api_url: impl Into<String>, token: impl Into<String>) -> Self {
        let api_url = api_url.into().trim_end_matches('/').to_string();
        Self {
            gateway_url: gateway_url_for(&api_url),
            api_url,
            token: token.into(),
            state_path: PathBuf::from("switchboard-state.json"),
            directory_ttl: Duration::from_secs(10 * 60),
            stream: StreamConfig::default(),
            feed: FeedConfig::default(),
        }
    }

    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let api_url = lookup("SWITCHBOARD_API_URL").unwrap_or_else(|| "http://127.0.0.1:3000".into());
        let token = lookup("SWITCHBOARD_TOKEN")
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ClientError::Backend("SWITCHBOARD_TOKEN is not set".into()))?;

        let mut config = Self::new(api_url, token);
        if let Some(url) = lookup("SWITCHBOARD_GATEWAY_URL") {
            config.gateway_url = url;
        }
        if let Some(path) = lookup("SWITCHBOARD_STATE_PATH") {
            config.state_path = path.into();
        }
        Ok(config)
    }
}

fn gateway_url_for(api_url: &str) -> String {
    format!(
        "{}/gateway",
        api_url.replace("http://", "ws://").replace("https://", "wss://")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_url_follows_the_api_scheme() {
        let config = ClientConfig::new("https://desk.example.com/", "t");
        assert_eq!(config.api_url, "https://desk.example.com");
        assert_eq!(config.gateway_url, "wss://desk.example.com/gateway");
    }

    #[test]
    fn token_is_required() {
        assert!(ClientConfig::from_lookup(|_| None).is_err());

        let config = ClientConfig::from_lookup(|key| match key {
            "SWITCHBOARD_TOKEN" => Some("abc".into()),
            "SWITCHBOARD_STATE_PATH" => Some("/tmp/state.json".into()),
            _ => None,
        })
        .unwrap();
        assert_eq!(config.token, "abc");
        assert_eq!(config.gateway_url, "ws://127.0.0.1:3000/gateway");
        assert_eq!(config.state_path, PathBuf::from("/tmp/state.json"));
        assert_eq!(config.feed.cap, 8);
    }
}
