//! Runtime settings for the form engine and reorder service.

use std::{env, time::Duration};

use db::DBService;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value:?}")]
    InvalidValue { name: &'static str, value: String },
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database_url: String,
    /// Deepest nesting accepted by a tree rebuild; top-level nodes are depth 1.
    pub tree_max_depth: usize,
    /// Rows per bulk update statement.
    pub reorder_chunk_size: usize,
    pub permission_cache_ttl_secs: u64,
    pub permission_cache_capacity: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "sqlite://ave.db".to_string(),
            tree_max_depth: 5,
            reorder_chunk_size: 500,
            permission_cache_ttl_secs: 300,
            permission_cache_capacity: 10_000,
        }
    }
}

impl Config {
    /// Defaults overridden by `AVE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Ok(url) = env::var("AVE_DATABASE_URL") {
            config.database_url = url;
        }
        if let Some(depth) = parse_var("AVE_TREE_MAX_DEPTH")? {
            config.tree_max_depth = depth;
        }
        if let Some(chunk) = parse_var("AVE_REORDER_CHUNK_SIZE")? {
            config.reorder_chunk_size = chunk;
        }
        if let Some(ttl) = parse_var("AVE_PERMISSION_CACHE_TTL_SECS")? {
            config.permission_cache_ttl_secs = ttl;
        }
        if let Some(capacity) = parse_var("AVE_PERMISSION_CACHE_CAPACITY")? {
            config.permission_cache_capacity = capacity;
        }
        Ok(config)
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Open the configured database and run migrations.
    pub async fn open_database(&self) -> Result<DBService, sqlx::Error> {
        DBService::new(&self.database_url).await
    }

    pub fn permission_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.permission_cache_ttl_secs)
    }
}

fn parse_var<T: std::str::FromStr>(name: &'static str) -> Result<Option<T>, ConfigError> {
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { name, value }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.tree_max_depth, 5);
        assert_eq!(config.reorder_chunk_size, 500);
        assert_eq!(config.permission_cache_ttl(), Duration::from_secs(300));
    }

    #[test]
    fn json_fills_missing_fields_with_defaults() {
        let config = Config::from_json_str(r#"{"tree_max_depth": 3}"#).unwrap();
        assert_eq!(config.tree_max_depth, 3);
        assert_eq!(config.reorder_chunk_size, 500);
    }

    #[test]
    fn json_rejects_wrong_types() {
        assert!(Config::from_json_str(r#"{"tree_max_depth": "deep"}"#).is_err());
    }

    const VARS: [&str; 5] = [
        "AVE_DATABASE_URL",
        "AVE_TREE_MAX_DEPTH",
        "AVE_REORDER_CHUNK_SIZE",
        "AVE_PERMISSION_CACHE_TTL_SECS",
        "AVE_PERMISSION_CACHE_CAPACITY",
    ];

    fn clear_vars() {
        for name in VARS {
            // SAFETY: only this test touches the AVE_* variables.
            unsafe { env::remove_var(name) };
        }
    }

    fn set_var(name: &str, value: &str) {
        // SAFETY: as above.
        unsafe { env::set_var(name, value) };
    }

    // Environment variables are process-wide, so every from_env case runs
    // in this one test.
    #[test]
    fn from_env_overrides_and_rejects_bad_values() {
        clear_vars();
        assert_eq!(Config::from_env().unwrap(), Config::default());

        set_var("AVE_DATABASE_URL", "sqlite::memory:");
        set_var("AVE_TREE_MAX_DEPTH", " 3 ");
        set_var("AVE_REORDER_CHUNK_SIZE", "50");
        set_var("AVE_PERMISSION_CACHE_TTL_SECS", "60");
        set_var("AVE_PERMISSION_CACHE_CAPACITY", "100");
        let config = Config::from_env().unwrap();
        assert_eq!(config.database_url, "sqlite::memory:");
        assert_eq!(config.tree_max_depth, 3);
        assert_eq!(config.reorder_chunk_size, 50);
        assert_eq!(config.permission_cache_ttl(), Duration::from_secs(60));
        assert_eq!(config.permission_cache_capacity, 100);

        set_var("AVE_REORDER_CHUNK_SIZE", "lots");
        match Config::from_env() {
            Err(ConfigError::InvalidValue { name, value }) => {
                assert_eq!(name, "AVE_REORDER_CHUNK_SIZE");
                assert_eq!(value, "lots");
            }
            other => panic!("expected InvalidValue, got {other:?}"),
        }

        set_var("AVE_REORDER_CHUNK_SIZE", "50");
        set_var("AVE_PERMISSION_CACHE_TTL_SECS", "-1");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::InvalidValue {
                name: "AVE_PERMISSION_CACHE_TTL_SECS",
                ..
            })
        ));
        clear_vars();
    }

    #[tokio::test]
    async fn opens_the_configured_database() {
        let config = Config {
            database_url: "sqlite::memory:".to_string(),
            ..Config::default()
        };
        assert!(config.open_database().await.is_ok());
    }
}
