use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::policy::ResourceDefaults;

/// Crate configuration. Embedders either deserialize this from their own
/// config source or start from `Config::default()` / `Config::from_env()`
/// and override fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database_path: String,
    pub workspace_root: PathBuf,
    /// Host name or address embedded in access URLs handed back to users.
    pub advertised_host: String,
    pub port_range_start: u16,
    pub port_range_end: u16,
    /// Grace period passed to the engine when stopping a container.
    pub stop_grace_secs: u64,
    /// Default deadline for image pulls and builds when the create request
    /// does not carry its own.
    pub image_timeout_secs: u64,
    /// Containers a single user may hold across all kinds.
    pub max_containers_per_user: i64,
    pub defaults: ResourceDefaults,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: "corral.db".to_string(),
            workspace_root: PathBuf::from("/var/lib/corral/workspaces"),
            advertised_host: "localhost".to_string(),
            port_range_start: 8000,
            port_range_end: 8999,
            stop_grace_secs: 10,
            image_timeout_secs: 300,
            max_containers_per_user: 3,
            defaults: ResourceDefaults::default(),
        }
    }
}

impl Config {
    /// Build a config from `CORRAL_*` environment variables, falling back
    /// to defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("CORRAL_DATABASE_PATH") {
            config.database_path = path;
        }
        if let Ok(root) = std::env::var("CORRAL_WORKSPACE_ROOT") {
            config.workspace_root = PathBuf::from(root);
        }
        if let Ok(host) = std::env::var("CORRAL_ADVERTISED_HOST") {
            config.advertised_host = host;
        }
        if let Some(start) = env_parse("CORRAL_PORT_RANGE_START") {
            config.port_range_start = start;
        }
        if let Some(end) = env_parse("CORRAL_PORT_RANGE_END") {
            config.port_range_end = end;
        }
        if let Some(grace) = env_parse("CORRAL_STOP_GRACE_SECS") {
            config.stop_grace_secs = grace;
        }
        if let Some(timeout) = env_parse("CORRAL_IMAGE_TIMEOUT_SECS") {
            config.image_timeout_secs = timeout;
        }
        if let Some(max) = env_parse("CORRAL_MAX_CONTAINERS_PER_USER") {
            config.max_containers_per_user = max;
        }

        config
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("Ignoring unparsable {}={}", key, raw);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert!(config.port_range_start < config.port_range_end);
        assert!(config.max_containers_per_user > 0);
        assert_eq!(config.defaults.memory_mb, 15360);
    }

    #[test]
    fn deserializes_partial_toml_shaped_json() {
        let config: Config =
            serde_json::from_str(r#"{"advertised_host": "lab.example.org"}"#).unwrap();
        assert_eq!(config.advertised_host, "lab.example.org");
        assert_eq!(config.port_range_start, 8000);
    }
}
