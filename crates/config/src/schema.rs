//! Config schema for the gateway and its CLI.

use std::time::Duration;

use {
    secrecy::{ExposeSecret, Secret},
    serde::Deserialize,
};

use crate::{ConfigError, loader::data_dir};

/// Root configuration.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct DuetConfig {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub storage: StorageConfig,
    pub presence: PresenceConfig,
    pub history: HistoryConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    /// Largest inbound WebSocket frame accepted from a client.
    pub max_frame_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".into(),
            port: 18790,
            max_frame_bytes: 64 * 1024,
        }
    }
}

/// Session token verification. There is no built-in secret.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// HS256 key shared with the identity service.
    pub jwt_secret: Option<Secret<String>>,
    /// Clock skew tolerated when checking `exp`.
    pub leeway_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: None,
            leeway_secs: 30,
        }
    }
}

impl AuthConfig {
    /// The configured secret, or [`ConfigError::MissingSecret`] when absent or blank.
    pub fn secret(&self) -> Result<&str, ConfigError> {
        self.jwt_secret
            .as_ref()
            .map(|s| s.expose_secret().as_str())
            .filter(|s| !s.trim().is_empty())
            .ok_or(ConfigError::MissingSecret)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub database_url: String,
    /// Bound on every persistence call made from the event path.
    pub timeout_ms: u64,
    pub max_connections: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_url: format!("sqlite://{}", data_dir().join("duet.db").display()),
            timeout_ms: 5_000,
            max_connections: 8,
        }
    }
}

impl StorageConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    /// Bound on the user-profile lookup made before each online-list broadcast.
    pub enrichment_timeout_ms: u64,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            enrichment_timeout_ms: 1_500,
        }
    }
}

impl PresenceConfig {
    pub fn enrichment_timeout(&self) -> Duration {
        Duration::from_millis(self.enrichment_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub default_page_size: u32,
    pub max_page_size: u32,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            default_page_size: 50,
            max_page_size: 200,
        }
    }
}

impl HistoryConfig {
    /// `requested` (or the default) clamped to `[1, max_page_size]`.
    pub fn page_size(&self, requested: Option<u32>) -> u32 {
        requested
            .unwrap_or(self.default_page_size)
            .clamp(1, self.max_page_size.max(1))
    }
}

impl DuetConfig {
    /// Apply `DUET_*` overrides resolved through `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(secret) = lookup("DUET_JWT_SECRET") {
            self.auth.jwt_secret = Some(Secret::new(secret));
        }
        if let Some(url) = lookup("DUET_DATABASE_URL") {
            self.storage.database_url = url;
        }
        if let Some(bind) = lookup("DUET_BIND") {
            self.server.bind = bind;
        }
        if let Some(port) = lookup("DUET_PORT") {
            match port.parse() {
                Ok(port) => self.server.port = port,
                Err(_) => tracing::warn!(value = %port, "ignoring non-numeric DUET_PORT"),
            }
        }
    }

    /// Apply overrides from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Check everything the gateway needs before it binds a socket.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.auth.secret()?;
        if self.storage.database_url.trim().is_empty() {
            return Err(ConfigError::Invalid("storage.database_url is empty".into()));
        }
        if self.storage.timeout_ms == 0 {
            return Err(ConfigError::Invalid("storage.timeout_ms must be > 0".into()));
        }
        if self.storage.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "storage.max_connections must be > 0".into(),
            ));
        }
        if self.presence.enrichment_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "presence.enrichment_timeout_ms must be > 0".into(),
            ));
        }
        if self.history.default_page_size == 0 || self.history.max_page_size == 0 {
            return Err(ConfigError::Invalid("history page sizes must be > 0".into()));
        }
        if self.history.default_page_size > self.history.max_page_size {
            return Err(ConfigError::Invalid(
                "history.default_page_size exceeds history.max_page_size".into(),
            ));
        }
        if self.server.max_frame_bytes == 0 {
            return Err(ConfigError::Invalid("server.max_frame_bytes must be > 0".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_secret(secret: &str) -> DuetConfig {
        let mut cfg = DuetConfig::default();
        cfg.auth.jwt_secret = Some(Secret::new(secret.to_string()));
        cfg
    }

    #[test]
    fn default_config_has_no_secret() {
        let cfg = DuetConfig::default();
        assert!(matches!(cfg.validate(), Err(ConfigError::MissingSecret)));
    }

    #[test]
    fn blank_secret_is_rejected() {
        assert!(matches!(
            with_secret("   ").validate(),
            Err(ConfigError::MissingSecret)
        ));
    }

    #[test]
    fn configured_secret_validates() {
        let cfg = with_secret("topsecret");
        cfg.validate().unwrap();
        assert_eq!(cfg.auth.secret().unwrap(), "topsecret");
    }

    #[test]
    fn zero_storage_timeout_is_invalid() {
        let mut cfg = with_secret("k");
        cfg.storage.timeout_ms = 0;
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn frame_limit_defaults_to_64k_and_rejects_zero() {
        let mut cfg = with_secret("k");
        assert_eq!(cfg.server.max_frame_bytes, 64 * 1024);
        cfg.server.max_frame_bytes = 0;
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn default_page_size_cannot_exceed_max() {
        let mut cfg = with_secret("k");
        cfg.history.default_page_size = 500;
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn page_size_is_clamped() {
        let history = HistoryConfig::default();
        assert_eq!(history.page_size(None), 50);
        assert_eq!(history.page_size(Some(0)), 1);
        assert_eq!(history.page_size(Some(20)), 20);
        assert_eq!(history.page_size(Some(10_000)), 200);
    }

    #[test]
    fn overrides_replace_file_values() {
        let mut cfg = DuetConfig::default();
        cfg.apply_overrides(|name| match name {
            "DUET_JWT_SECRET" => Some("from-env".into()),
            "DUET_PORT" => Some("9001".into()),
            "DUET_DATABASE_URL" => Some("sqlite::memory:".into()),
            _ => None,
        });
        assert_eq!(cfg.auth.secret().unwrap(), "from-env");
        assert_eq!(cfg.server.port, 9001);
        assert_eq!(cfg.storage.database_url, "sqlite::memory:");
        assert_eq!(cfg.server.bind, "127.0.0.1");
    }

    #[test]
    fn bad_port_override_is_ignored() {
        let mut cfg = DuetConfig::default();
        cfg.apply_overrides(|name| (name == "DUET_PORT").then(|| "http".to_string()));
        assert_eq!(cfg.server.port, 18790);
    }
}
