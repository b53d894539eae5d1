use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::gateway::DEFAULT_PROFILE_ENDPOINT;
use crate::policy::DEFAULT_MANDATORY_PREFIXES;
use crate::sync::SyncConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub api: ApiConfig,
  #[serde(default)]
  pub connectivity: ConnectivityConfig,
  #[serde(default)]
  pub sync: SyncSettings,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub policy: PolicyConfig,
  #[serde(default)]
  pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  /// Base URL of the REST API, e.g. https://api.example.com/v1
  pub url: String,
  /// Per-request timeout; an expired request counts as unreachable
  #[serde(default = "default_request_timeout")]
  pub timeout_secs: u64,
  /// Endpoint whose response carries the subscription tier
  #[serde(default = "default_profile_endpoint")]
  pub profile_endpoint: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectivityConfig {
  /// URL probed for reachability (defaults to the API base URL)
  pub check_url: Option<String>,
  #[serde(default = "default_probe_timeout")]
  pub timeout_secs: u64,
  #[serde(default = "default_poll_interval")]
  pub poll_interval_secs: u64,
}

impl Default for ConnectivityConfig {
  fn default() -> Self {
    Self {
      check_url: None,
      timeout_secs: default_probe_timeout(),
      poll_interval_secs: default_poll_interval(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncSettings {
  #[serde(default = "default_max_retries")]
  pub max_retries: u32,
  #[serde(default = "default_page_size")]
  pub page_size: usize,
  /// Lifetime of the drain lease shared by processes using one database
  #[serde(default = "default_lease_secs")]
  pub lease_secs: u64,
}

impl Default for SyncSettings {
  fn default() -> Self {
    Self {
      max_retries: default_max_retries(),
      page_size: default_page_size(),
      lease_secs: default_lease_secs(),
    }
  }
}

impl From<&SyncSettings> for SyncConfig {
  fn from(settings: &SyncSettings) -> Self {
    SyncConfig {
      max_retries: settings.max_retries,
      page_size: settings.page_size,
      lease_ttl: Duration::from_secs(settings.lease_secs),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  #[serde(default = "default_true")]
  pub enabled: bool,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self { enabled: true }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PolicyConfig {
  /// Path prefixes that always require the network (auth, onboarding)
  #[serde(default = "default_mandatory_prefixes")]
  pub mandatory_prefixes: Vec<String>,
}

impl Default for PolicyConfig {
  fn default() -> Self {
    Self {
      mandatory_prefixes: default_mandatory_prefixes(),
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
  /// SQLite file for cache and queue (defaults to the user data directory)
  pub path: Option<PathBuf>,
}

fn default_request_timeout() -> u64 {
  15
}

fn default_profile_endpoint() -> String {
  DEFAULT_PROFILE_ENDPOINT.to_string()
}

fn default_probe_timeout() -> u64 {
  5
}

fn default_poll_interval() -> u64 {
  10
}

fn default_max_retries() -> u32 {
  3
}

fn default_page_size() -> usize {
  50
}

fn default_lease_secs() -> u64 {
  60
}

fn default_true() -> bool {
  true
}

fn default_mandatory_prefixes() -> Vec<String> {
  DEFAULT_MANDATORY_PREFIXES
    .iter()
    .map(|p| p.to_string())
    .collect()
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./revalsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/revalsync/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/revalsync/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("revalsync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("revalsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    config.validate()?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    url::Url::parse(&self.api.url)
      .map_err(|e| eyre!("Invalid api.url {}: {}", self.api.url, e))?;
    if let Some(check_url) = &self.connectivity.check_url {
      url::Url::parse(check_url)
        .map_err(|e| eyre!("Invalid connectivity.check_url {}: {}", check_url, e))?;
    }
    if self.sync.max_retries == 0 {
      return Err(eyre!("sync.max_retries must be at least 1"));
    }
    if self.sync.page_size == 0 {
      return Err(eyre!("sync.page_size must be at least 1"));
    }
    if self.sync.lease_secs <= self.api.timeout_secs {
      return Err(eyre!(
        "sync.lease_secs ({}) must be longer than api.timeout_secs ({})",
        self.sync.lease_secs,
        self.api.timeout_secs
      ));
    }
    Ok(())
  }

  pub fn request_timeout(&self) -> Duration {
    Duration::from_secs(self.api.timeout_secs)
  }

  pub fn probe_timeout(&self) -> Duration {
    Duration::from_secs(self.connectivity.timeout_secs)
  }

  pub fn poll_interval(&self) -> Duration {
    Duration::from_secs(self.connectivity.poll_interval_secs)
  }

  /// Directory for log files: `logs/` next to a configured database, else
  /// the default data directory.
  pub fn log_dir(&self) -> Result<PathBuf> {
    match self.storage.path.as_deref().and_then(Path::parent) {
      Some(parent) => Ok(parent.join("logs")),
      None => crate::logging::default_log_dir(),
    }
  }

  /// URL the connectivity probe checks.
  pub fn check_url(&self) -> &str {
    self
      .connectivity
      .check_url
      .as_deref()
      .unwrap_or(&self.api.url)
  }

  /// Get the API bearer token from environment variables.
  ///
  /// Checks REVALSYNC_TOKEN first, then REVALSYNC_API_TOKEN as fallback.
  /// Requests go out unauthenticated when neither is set.
  pub fn get_api_token() -> Option<String> {
    std::env::var("REVALSYNC_TOKEN")
      .or_else(|_| std::env::var("REVALSYNC_API_TOKEN"))
      .ok()
      .filter(|t| !t.is_empty())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn write_config(contents: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.yaml");
    std::fs::write(&path, contents).unwrap();
    (dir, path)
  }

  #[test]
  fn test_minimal_config_uses_defaults() {
    let (_dir, path) = write_config("api:\n  url: https://api.example.com/v1\n");

    let config = Config::load(Some(&path)).unwrap();

    assert_eq!(config.request_timeout(), Duration::from_secs(15));
    assert_eq!(config.api.profile_endpoint, "/users/profile");
    assert_eq!(config.check_url(), "https://api.example.com/v1");
    assert_eq!(config.sync.max_retries, 3);
    assert_eq!(config.sync.page_size, 50);
    assert!(config.cache.enabled);
    assert_eq!(config.policy.mandatory_prefixes, vec!["/auth", "/onboarding"]);
    assert!(config.storage.path.is_none());
    assert_eq!(SyncConfig::from(&config.sync).lease_ttl, Duration::from_secs(60));
  }

  #[test]
  fn test_full_config() {
    let (_dir, path) = write_config(
      r#"
api:
  url: https://api.example.com/v1
  timeout_secs: 20
  profile_endpoint: /me
connectivity:
  check_url: https://api.example.com/health
  timeout_secs: 2
  poll_interval_secs: 30
sync:
  max_retries: 5
  page_size: 10
cache:
  enabled: false
policy:
  mandatory_prefixes: [/auth, /onboarding, /payments]
storage:
  path: /tmp/revalsync.db
"#,
    );

    let config = Config::load(Some(&path)).unwrap();

    assert_eq!(config.request_timeout(), Duration::from_secs(20));
    assert_eq!(config.check_url(), "https://api.example.com/health");
    assert_eq!(config.poll_interval(), Duration::from_secs(30));
    let sync = SyncConfig::from(&config.sync);
    assert_eq!(sync.max_retries, 5);
    assert_eq!(sync.page_size, 10);
    assert!(!config.cache.enabled);
    assert_eq!(config.policy.mandatory_prefixes.len(), 3);
    assert_eq!(config.storage.path, Some(PathBuf::from("/tmp/revalsync.db")));
    assert_eq!(config.log_dir().unwrap(), PathBuf::from("/tmp/logs"));
  }

  #[test]
  fn test_log_dir_follows_relocated_database() {
    let (_dir, path) = write_config(
      "api:\n  url: https://api.example.com\nstorage:\n  path: /srv/revalsync/data/offline.db\n",
    );

    let config = Config::load(Some(&path)).unwrap();

    assert_eq!(config.log_dir().unwrap(), PathBuf::from("/srv/revalsync/data/logs"));
  }

  #[test]
  fn test_lease_must_outlive_a_request() {
    let (_dir, path) = write_config(
      "api:\n  url: https://api.example.com\n  timeout_secs: 30\nsync:\n  lease_secs: 30\n",
    );
    assert!(Config::load(Some(&path)).is_err());
  }

  #[test]
  fn test_missing_explicit_path_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    assert!(Config::load(Some(&dir.path().join("nope.yaml"))).is_err());
  }

  #[test]
  fn test_invalid_url_rejected() {
    let (_dir, path) = write_config("api:\n  url: not a url\n");
    assert!(Config::load(Some(&path)).is_err());
  }

  #[test]
  fn test_zero_retries_rejected() {
    let (_dir, path) =
      write_config("api:\n  url: https://api.example.com\nsync:\n  max_retries: 0\n");
    assert!(Config::load(Some(&path)).is_err());
  }
}
