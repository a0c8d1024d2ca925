use std::path::{Path, PathBuf};

use tracing::debug;

use crate::{ConfigError, env_subst::substitute_env, schema::DuetConfig};

/// Standard config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &["duet.toml", "duet.yaml", "duet.yml", "duet.json"];

/// Load config from the given path (any supported format), with `${VAR}`
/// substitution. Env overrides are not applied.
pub fn load_config(path: &Path) -> Result<DuetConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_config(&substitute_env(&raw), path)
}

/// Resolve the effective config.
///
/// Search order:
/// 1. `explicit` (must exist when given)
/// 2. `./duet.{toml,yaml,yml,json}` (project-local)
/// 3. `~/.config/duet/duet.{toml,yaml,yml,json}` (user-global)
///
/// Falls back to [`DuetConfig::default()`] when nothing is found. `DUET_*`
/// environment overrides are applied last.
pub fn discover_and_load(explicit: Option<&Path>) -> Result<DuetConfig, ConfigError> {
    let mut config = match explicit.map(Path::to_path_buf).or_else(find_config_file) {
        Some(path) => {
            debug!(path = %path.display(), "loading config");
            load_config(&path)?
        },
        None => {
            debug!("no config file found, using defaults");
            DuetConfig::default()
        },
    };
    config.apply_env_overrides();
    Ok(config)
}

fn find_config_file() -> Option<PathBuf> {
    let local = CONFIG_FILENAMES.iter().map(PathBuf::from);
    let global = config_dir()
        .into_iter()
        .flat_map(|dir| CONFIG_FILENAMES.iter().map(move |name| dir.join(name)));
    local.chain(global).find(|p| p.exists())
}

/// `~/.config/duet/` on all platforms.
pub fn config_dir() -> Option<PathBuf> {
    home_dir().map(|h| h.join(".config").join("duet"))
}

/// `~/.duet/` on all platforms; holds the default SQLite database.
pub fn data_dir() -> PathBuf {
    home_dir()
        .map(|h| h.join(".duet"))
        .unwrap_or_else(|| PathBuf::from(".duet"))
}

fn home_dir() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.home_dir().to_path_buf())
}

fn parse_config(raw: &str, path: &Path) -> Result<DuetConfig, ConfigError> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");
    let parse_err = |message: String| ConfigError::Parse {
        path: path.to_path_buf(),
        message,
    };

    match ext {
        "toml" => toml::from_str(raw).map_err(|e| parse_err(e.to_string())),
        "yaml" | "yml" => serde_yaml::from_str(raw).map_err(|e| parse_err(e.to_string())),
        "json" => serde_json::from_str(raw).map_err(|e| parse_err(e.to_string())),
        other => Err(ConfigError::UnsupportedFormat(other.to_string())),
    }
}
