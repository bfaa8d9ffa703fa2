use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, bail};

/// Placeholder JWT secrets that MUST NOT be used.
const PLACEHOLDER_SECRETS: &[&str] = &[
    "change-me-to-a-random-string",
    "dev-secret-change-me",
];

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub jwt_secret: String,
    pub db_path: PathBuf,
    pub addr: SocketAddr,
}

impl ServerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup so the rules can be exercised
    /// without touching the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let jwt_secret = lookup("SWITCHBOARD_JWT_SECRET").unwrap_or_default();
        if jwt_secret.is_empty() || PLACEHOLDER_SECRETS.contains(&jwt_secret.as_str()) {
            bail!(
                "SWITCHBOARD_JWT_SECRET is unset or still a placeholder; \
                 it must match the identity service's signing secret"
            );
        }

        let db_path = lookup("SWITCHBOARD_DB_PATH")
            .unwrap_or_else(|| "switchboard.db".into())
            .into();
        let host = lookup("SWITCHBOARD_HOST").unwrap_or_else(|| "0.0.0.0".into());
        let port: u16 = lookup("SWITCHBOARD_PORT")
            .unwrap_or_else(|| "3000".into())
            .parse()
            .context("SWITCHBOARD_PORT is not a port number")?;
        let addr = format!("{}:{}", host, port)
            .parse()
            .with_context(|| format!("invalid listen address {}:{}", host, port))?;

        Ok(Self { jwt_secret, db_path, addr })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn rejects_missing_and_placeholder_secrets() {
        assert!(ServerConfig::from_lookup(lookup_from(&[])).is_err());
        assert!(
            ServerConfig::from_lookup(lookup_from(&[("SWITCHBOARD_JWT_SECRET", "dev-secret-change-me")]))
                .is_err()
        );
    }

    #[test]
    fn defaults_fill_in_the_rest() {
        let config = ServerConfig::from_lookup(lookup_from(&[("SWITCHBOARD_JWT_SECRET", "s3cret")])).unwrap();
        assert_eq!(config.db_path, PathBuf::from("switchboard.db"));
        assert_eq!(config.addr.port(), 3000);
    }

    #[test]
    fn bad_port_is_an_error() {
        let result = ServerConfig::from_lookup(lookup_from(&[
            ("SWITCHBOARD_JWT_SECRET", "s3cret"),
            ("SWITCHBOARD_PORT", "eighty"),
        ]));
        assert!(result.is_err());
    }
}
