//! Application configuration management.
//!
//! This module handles loading and saving the client configuration: which
//! backend to talk to, where the session token is kept, and the last used
//! username.
//!
//! Configuration is stored at `~/.config/doclens/config.json`. Environment
//! variables override the file (see [`Config::apply_overrides`]).

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::auth::{FileTokenStore, KeyringTokenStore, MemoryTokenStore, TokenStore};

/// Application name used for config/cache directory paths and the keychain service
pub const APP_NAME: &str = "doclens";

/// Config file name
const CONFIG_FILE: &str = "config.json";

pub const DEFAULT_API_ORIGIN: &str = "http://localhost:8000";
pub const DEFAULT_API_PREFIX: &str = "/api/v1";

pub const ENV_API_ORIGIN: &str = "DOCLENS_API_ORIGIN";
pub const ENV_API_PREFIX: &str = "DOCLENS_API_PREFIX";
pub const ENV_TOKEN_STORAGE: &str = "DOCLENS_TOKEN_STORAGE";
pub const ENV_REQUEST_TIMEOUT: &str = "DOCLENS_REQUEST_TIMEOUT_SECS";

/// Where the bearer token is persisted between runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TokenStorage {
    #[default]
    File,
    Keyring,
    /// Not persisted: every run starts signed out.
    Memory,
}

impl std::str::FromStr for TokenStorage {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "file" => Ok(TokenStorage::File),
            "keyring" | "keychain" => Ok(TokenStorage::Keyring),
            "memory" | "none" => Ok(TokenStorage::Memory),
            other => Err(anyhow::anyhow!("Unknown token storage '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_origin: String,
    pub api_prefix: String,
    pub request_timeout_secs: Option<u64>,
    pub token_storage: TokenStorage,
    pub last_username: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_origin: DEFAULT_API_ORIGIN.to_string(),
            api_prefix: DEFAULT_API_PREFIX.to_string(),
            request_timeout_secs: None,
            token_storage: TokenStorage::default(),
            last_username: None,
        }
    }
}

impl Config {
    /// Load from the config file (defaults if missing) and apply environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_path()?)?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse config file {}", path.display()))
        } else {
            debug!(path = %path.display(), "No config file, using defaults");
            Ok(Self::default())
        }
    }

    /// Apply overrides from a key lookup (the process environment in `load`).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(origin) = lookup(ENV_API_ORIGIN) {
            self.api_origin = origin;
        }
        if let Some(prefix) = lookup(ENV_API_PREFIX) {
            self.api_prefix = prefix;
        }
        if let Some(storage) = lookup(ENV_TOKEN_STORAGE) {
            self.token_storage = storage.parse()?;
        }
        if let Some(timeout) = lookup(ENV_REQUEST_TIMEOUT) {
            let secs: u64 = timeout
                .trim()
                .parse()
                .with_context(|| format!("{} must be a number of seconds", ENV_REQUEST_TIMEOUT))?;
            self.request_timeout_secs = (secs > 0).then_some(secs);
        }
        Ok(())
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn cache_dir(&self) -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    /// Origin plus version prefix, without a trailing slash.
    pub fn base_url(&self) -> String {
        let origin = self.api_origin.trim().trim_end_matches('/');
        let prefix = self.api_prefix.trim().trim_matches('/');
        if prefix.is_empty() {
            origin.to_string()
        } else {
            format!("{}/{}", origin, prefix)
        }
    }

    pub fn token_store(&self) -> Result<Arc<dyn TokenStore>> {
        Ok(match self.token_storage {
            TokenStorage::File => Arc::new(FileTokenStore::new(self.cache_dir()?)),
            TokenStorage::Keyring => Arc::new(KeyringTokenStore::new(APP_NAME)),
            TokenStorage::Memory => Arc::new(MemoryTokenStore::new()),
        })
    }
}
