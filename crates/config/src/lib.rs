//! Configuration loading for duet.
//!
//! Config files are discovered in `./` then `~/.config/duet/`, may be TOML,
//! YAML or JSON, and support `${VAR}` / `${VAR:-fallback}` placeholders.
//! `DUET_*` environment variables override file values.

pub mod env_subst;
pub mod loader;
pub mod schema;

use std::path::PathBuf;

pub use {
    loader::{config_dir, data_dir, discover_and_load, load_config},
    schema::{AuthConfig, DuetConfig, HistoryConfig, PresenceConfig, ServerConfig, StorageConfig},
};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {}: {message}", path.display())]
    Parse { path: PathBuf, message: String },

    #[error("unsupported config format: .{0}")]
    UnsupportedFormat(String),

    #[error("auth.jwt_secret is not configured (set it in duet.toml or DUET_JWT_SECRET)")]
    MissingSecret,

    #[error("invalid config: {0}")]
    Invalid(String),
}
