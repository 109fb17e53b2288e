//! Configuration module for the key gateway

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::keys::record::DEFAULT_QUOTA_PER_DAY;

/// Main application settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub auth: AuthSettings,
    pub registry: RegistrySettings,
    pub r2: R2Config,
    pub database: DatabaseSettings,
    pub inference: InferenceSettings,
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub workers: Option<usize>,
}

/// Credential validation settings
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    /// Static override credential; empty disables it
    pub master_key: String,
    pub default_quota_per_day: u32,
    /// Fingerprint cache TTL; 0 disables the cache
    pub cache_ttl_secs: u64,
    pub cache_max_entries: u64,
}

impl std::fmt::Debug for AuthSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthSettings")
            .field("master_key", &if self.master_key.is_empty() { "<unset>" } else { "<redacted>" })
            .field("default_quota_per_day", &self.default_quota_per_day)
            .field("cache_ttl_secs", &self.cache_ttl_secs)
            .field("cache_max_entries", &self.cache_max_entries)
            .finish()
    }
}

impl AuthSettings {
    pub fn master_key(&self) -> Option<String> {
        Some(self.master_key.clone()).filter(|k| !k.trim().is_empty())
    }
}

/// Registry backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryBackend {
    /// Single JSON document in R2
    Blob,
    /// One row per key in PostgreSQL
    Document,
    /// In-process document store, lost on restart
    Memory,
}

/// Key registry configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegistrySettings {
    pub backend: RegistryBackend,
    /// Upper bound on every registry call
    pub timeout_secs: u64,
    /// Object key of the registry document (blob backend)
    pub object_key: String,
}

impl RegistrySettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Cloudflare R2 connection for the blob backend
#[derive(Clone, Default, Deserialize)]
#[serde(default)]
pub struct R2Config {
    /// `r2://<access_key_id>:<secret>@<account_id>/<bucket>`
    pub url: String,
}

impl std::fmt::Debug for R2Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("R2Config")
            .field("url", &if self.url.is_empty() { "<unset>" } else { "<redacted>" })
            .finish()
    }
}

/// Database configuration for PostgreSQL
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub url: String,
    pub max_connections: Option<usize>,
}

impl std::fmt::Debug for DatabaseSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseSettings")
            .field("url", &if self.url.is_empty() { "<unset>" } else { "<redacted>" })
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

/// Prediction service the gateway forwards to
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InferenceSettings {
    /// Base URL; empty disables `/api/v1/predict`
    pub url: String,
    pub timeout_secs: u64,
}

impl Settings {
    /// Load configuration from files and environment variables
    ///
    /// Configuration priority (highest to lowest):
    /// 1. Environment variables (prefixed with KEYGATE_)
    /// 2. config/local.toml (gitignored)
    /// 3. config/default.toml
    pub fn load() -> Result<Self, ConfigError> {
        let config_dir = std::env::var("CONFIG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config"));

        let builder = Config::builder()
            // Start with default configuration
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Add local overrides (gitignored)
            .add_source(File::from(config_dir.join("local.toml")).required(false))
            // Add environment variables (KEYGATE_AUTH__MASTER_KEY, etc.)
            .add_source(
                Environment::with_prefix("KEYGATE")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject combinations that cannot start
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.auth.default_quota_per_day == 0 {
            return Err(ConfigError::Message(
                "auth.default_quota_per_day must be at least 1".to_string(),
            ));
        }
        if self.registry.timeout_secs == 0 {
            return Err(ConfigError::Message(
                "registry.timeout_secs must be at least 1".to_string(),
            ));
        }
        match self.registry.backend {
            RegistryBackend::Blob if self.r2.url.trim().is_empty() => Err(ConfigError::Message(
                "registry.backend = \"blob\" requires r2.url".to_string(),
            )),
            RegistryBackend::Document if self.database.url.trim().is_empty() => {
                Err(ConfigError::Message(
                    "registry.backend = \"document\" requires database.url".to_string(),
                ))
            }
            _ => Ok(()),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            server: ServerSettings::default(),
            auth: AuthSettings::default(),
            registry: RegistrySettings::default(),
            r2: R2Config::default(),
            database: DatabaseSettings::default(),
            inference: InferenceSettings::default(),
        }
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        ServerSettings {
            host: "0.0.0.0".to_string(),
            port: 8080,
            workers: None,
        }
    }
}

impl Default for AuthSettings {
    fn default() -> Self {
        AuthSettings {
            master_key: String::new(),
            default_quota_per_day: DEFAULT_QUOTA_PER_DAY,
            cache_ttl_secs: 300,
            cache_max_entries: 10_000,
        }
    }
}

impl Default for RegistrySettings {
    fn default() -> Self {
        RegistrySettings {
            backend: RegistryBackend::Document,
            timeout_secs: 10,
            object_key: crate::storage::DEFAULT_OBJECT_KEY.to_string(),
        }
    }
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        DatabaseSettings {
            url: String::new(),
            max_connections: Some(10),
        }
    }
}

impl Default for InferenceSettings {
    fn default() -> Self {
        InferenceSettings {
            url: String::new(),
            timeout_secs: 30,
        }
    }
}
