//! Layered settings for the CLI.
//!
//! Precedence, lowest first:
//! 1. compiled defaults
//! 2. the JSON settings file, if given and present
//! 3. `MEDIAQ_*` environment variables, `__` separating nested keys
//!    (`MEDIAQ_STORAGE__MAX_CONNECTIONS=4`)
//! 4. command-line flags, applied by the caller

use std::path::Path;

use anyhow::{Context, Result};
use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized};
use mediaq_store::StorageConfig;
use mediaq_telemetry::LoggingConfig;
use serde::{Deserialize, Serialize};

/// Everything the CLI reads from files and the environment.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Pool, connection and diagnostics settings.
    pub storage: StorageConfig,
    /// Log level and format.
    pub logging: LoggingConfig,
}

impl Settings {
    /// Defaults merged with `path` (when it exists) and `MEDIAQ_*` variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::figment(path)
            .merge(Env::prefixed("MEDIAQ_").split("__"))
            .extract()
            .context("invalid mediaq settings")
    }

    /// Defaults merged with `path` only.
    pub fn figment(path: Option<&Path>) -> Figment {
        let figment = Figment::from(Serialized::defaults(Self::default()));
        match path {
            Some(path) => figment.merge(Json::file(path)),
            None => figment,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use mediaq_store::DatabaseLocation;

    #[test]
    fn defaults_without_file() {
        let settings: Settings = Settings::figment(None).extract().unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn file_overrides_only_what_it_names() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mediaq.json");
        std::fs::write(
            &path,
            r#"{
                "storage": {
                    "database": { "kind": "file", "path": "/srv/mediaq/queue.db" },
                    "max_connections": 3
                },
                "logging": { "level": "debug" }
            }"#,
        )
        .unwrap();

        let settings: Settings = Settings::figment(Some(&path)).extract().unwrap();
        assert_eq!(settings.storage.max_connections, 3);
        assert_eq!(
            settings.storage.database,
            DatabaseLocation::File("/srv/mediaq/queue.db".into())
        );
        assert_eq!(settings.storage.busy_timeout_ms, 5_000);
        assert_eq!(settings.logging.level, "debug");
    }

    #[test]
    fn missing_file_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let settings: Settings = Settings::figment(Some(&dir.path().join("absent.json")))
            .extract()
            .unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn memory_database_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mediaq.json");
        std::fs::write(&path, r#"{ "storage": { "database": { "kind": "memory" } } }"#).unwrap();
        let settings: Settings = Settings::figment(Some(&path)).extract().unwrap();
        assert_eq!(settings.storage.database, DatabaseLocation::Memory);
    }
}
