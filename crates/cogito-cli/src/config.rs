//! Configuration loading from TOML files.
//!
//! Lookup order:
//! 1. `$COGITO_CONFIG` environment variable
//! 2. `<config dir>/cogito/config.toml`
//! 3. Built-in defaults (everything is optional)

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use cogito_client::{
    ClientConfig, HttpSettings, RetryPolicy, DEFAULT_ANTHROPIC_VERSION, DEFAULT_BASE_URL,
    DEFAULT_MAX_TOKENS, DEFAULT_MODEL,
};
use cogito_store::CacheConfig;

/// Top-level configuration.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub model: ModelConfig,
    pub retry: RetryConfig,
    pub cache: CacheSettings,
    pub server: ServerConfig,
}

/// Vendor model and endpoint.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub id: String,
    pub max_tokens: u32,
    pub base_url: String,
    /// Name of the environment variable holding the API key.
    pub api_key_env: String,
    pub anthropic_version: String,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total calls per request, the first one included.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    /// Ceiling for a single vendor call.
    pub timeout_ms: u64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub expiry_secs: i64,
    pub max_entries: usize,
    pub vary_cached_thoughts: bool,
}

/// HTTP proxy settings (`cogito serve`).
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub rate_limit_window_ms: u64,
    pub rate_limit_max: u32,
    /// Tighter limit for the decide and reflect endpoints.
    pub endpoint_limit_max: u32,
}

// --- Defaults ---

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            id: DEFAULT_MODEL.into(),
            max_tokens: DEFAULT_MAX_TOKENS,
            base_url: DEFAULT_BASE_URL.into(),
            api_key_env: "ANTHROPIC_API_KEY".into(),
            anthropic_version: DEFAULT_ANTHROPIC_VERSION.into(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            timeout_ms: 60_000,
        }
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            expiry_secs: 3600,
            max_entries: 512,
            vary_cached_thoughts: true,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:3001".into(),
            rate_limit_window_ms: 60_000,
            rate_limit_max: 20,
            endpoint_limit_max: 10,
        }
    }
}

// --- Conversions into library settings ---

impl Config {
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            model: self.model.id.clone(),
            max_tokens: self.model.max_tokens,
            retry: RetryPolicy {
                max_attempts: self.retry.max_attempts,
                base_delay: Duration::from_millis(self.retry.base_delay_ms),
            },
            vary_cached_thoughts: self.cache.vary_cached_thoughts,
        }
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            max_age: chrono::Duration::seconds(self.cache.expiry_secs),
            max_entries: self.cache.max_entries,
        }
    }

    /// Transport settings, reading the API key from the configured variable.
    pub fn http_settings(&self) -> Result<HttpSettings> {
        let api_key = std::env::var(&self.model.api_key_env).with_context(|| {
            format!("API key variable {} is not set", self.model.api_key_env)
        })?;
        Ok(HttpSettings {
            base_url: self.model.base_url.clone(),
            api_key,
            anthropic_version: self.model.anthropic_version.clone(),
            timeout: Duration::from_millis(self.retry.timeout_ms),
        })
    }
}

/// Load config from disk. Returns defaults if no config file exists.
pub fn load_config() -> Result<Config> {
    match config_path() {
        Some(p) if p.exists() => load_config_from(&p),
        _ => Ok(Config::default()),
    }
}

pub fn load_config_from(path: &Path) -> Result<Config> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))
}

/// Resolve the config file path.
fn config_path() -> Option<PathBuf> {
    if let Ok(p) = std::env::var("COGITO_CONFIG") {
        return Some(PathBuf::from(p));
    }
    directories::BaseDirs::new().map(|dirs| dirs.config_dir().join("cogito").join("config.toml"))
}

/// Show the active config path (for `cogito config`).
pub fn show_config_path() -> String {
    match config_path() {
        Some(p) if p.exists() => format!("{} (loaded)", p.display()),
        Some(p) => format!("{} (not found, using defaults)", p.display()),
        None => "no config path resolved (using defaults)".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.model.id, "claude-3-7-sonnet-20250219");
        assert_eq!(config.model.max_tokens, 1000);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.timeout_ms, 60_000);
        assert_eq!(config.cache.expiry_secs, 3600);
        assert_eq!(config.server.rate_limit_max, 20);
        assert_eq!(config.server.endpoint_limit_max, 10);
    }

    #[test]
    fn test_parse_minimal_toml() {
        let toml_str = r#"
[retry]
base_delay_ms = 250
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.retry.base_delay_ms, 250);
        // Other fields should be defaults
        assert_eq!(config.retry.max_attempts, 3);
        assert!(config.cache.vary_cached_thoughts);
    }

    #[test]
    fn test_parse_full_toml() {
        let toml_str = r#"
[model]
id = "claude-test"
max_tokens = 500
base_url = "http://localhost:3001/api"
api_key_env = "TEST_KEY"
anthropic_version = "2023-06-01"

[retry]
max_attempts = 5
base_delay_ms = 10
timeout_ms = 2000

[cache]
expiry_secs = 60
max_entries = 8
vary_cached_thoughts = false

[server]
bind = "0.0.0.0:8080"
rate_limit_window_ms = 1000
rate_limit_max = 2
endpoint_limit_max = 1
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.model.api_key_env, "TEST_KEY");
        assert_eq!(config.server.bind, "0.0.0.0:8080");

        let client = config.client_config();
        assert_eq!(client.model, "claude-test");
        assert_eq!(client.retry.max_attempts, 5);
        assert_eq!(client.retry.base_delay, Duration::from_millis(10));
        assert!(!client.vary_cached_thoughts);

        let cache = config.cache_config();
        assert_eq!(cache.max_age, chrono::Duration::seconds(60));
        assert_eq!(cache.max_entries, 8);
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[cache]\nmax_entries = 3\n").unwrap();
        let config = load_config_from(&path).unwrap();
        assert_eq!(config.cache.max_entries, 3);
    }

    #[test]
    fn test_invalid_toml_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[cache\n").unwrap();
        let err = load_config_from(&path).unwrap_err();
        assert!(format!("{err:#}").contains("config.toml"));
    }

    #[test]
    fn test_missing_key_variable() {
        let mut config = Config::default();
        config.model.api_key_env = "COGITO_TEST_UNSET_KEY_VARIABLE".into();
        assert!(config.http_settings().is_err());
    }
}
