use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::cache::{PartitionName, Purpose};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Origin of the application; requests elsewhere pass through untouched
  pub origin: Url,
  /// Deployed worker generation; stale partitions are deleted on activation
  pub version: String,
  #[serde(default = "default_cache_prefix")]
  pub cache_prefix: String,
  /// Absolute paths fetched at install time
  #[serde(default = "default_precache")]
  pub precache: Vec<String>,
  /// Served when a navigation can be satisfied by neither network nor cache
  #[serde(default = "default_offline_fallback")]
  pub offline_fallback: String,
  /// Path prefixes routed network-first
  #[serde(default = "default_api_prefixes")]
  pub api_prefixes: Vec<String>,
  /// Mutating requests under these prefixes are queued under the route's tag
  /// on delivery failure
  #[serde(default)]
  pub sync_routes: Vec<SyncRoute>,
  /// Tag for same-origin mutating requests no sync route covers
  #[serde(default = "default_sync_tag")]
  pub default_sync_tag: String,
  #[serde(default = "default_max_replay_attempts")]
  pub max_replay_attempts: u32,
  #[serde(default = "default_periodic_sync_secs")]
  pub periodic_sync_secs: u64,
  #[serde(default)]
  pub notification: NotificationConfig,
  /// Database file override (default: $XDG_DATA_HOME/offsync/worker.db)
  pub database: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct SyncRoute {
  pub prefix: String,
  pub tag: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotificationConfig {
  #[serde(default = "default_notification_title")]
  pub default_title: String,
  #[serde(default = "default_notification_icon")]
  pub icon: String,
}

impl Default for NotificationConfig {
  fn default() -> Self {
    Self {
      default_title: default_notification_title(),
      icon: default_notification_icon(),
    }
  }
}

fn default_cache_prefix() -> String {
  "offsync".to_string()
}

fn default_precache() -> Vec<String> {
  vec!["/".to_string(), "/offline".to_string()]
}

fn default_offline_fallback() -> String {
  "/offline".to_string()
}

fn default_api_prefixes() -> Vec<String> {
  vec!["/api/".to_string()]
}

fn default_sync_tag() -> String {
  "sync-requests".to_string()
}

fn default_max_replay_attempts() -> u32 {
  10
}

fn default_periodic_sync_secs() -> u64 {
  300
}

fn default_notification_title() -> String {
  "New notification".to_string()
}

fn default_notification_icon() -> String {
  "/icons/icon-192.png".to_string()
}

/// Directory for the database and log files.
pub fn data_dir() -> Result<PathBuf> {
  let data_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?;

  Ok(data_dir.join("offsync"))
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./offsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/offsync/config.yaml
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
        "No configuration file found. Create one at ~/.config/offsync/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("offsync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("offsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Invalid config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config =
      serde_yaml::from_str(contents).map_err(|e| eyre!("Failed to parse config: {}", e))?;
    config.validate()?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    if self.version.trim().is_empty() {
      return Err(eyre!("version must not be empty"));
    }
    if self.default_sync_tag.trim().is_empty() {
      return Err(eyre!("default_sync_tag must not be empty"));
    }
    if let Some(path) = self.precache.iter().find(|p| !p.starts_with('/')) {
      return Err(eyre!("precache entry '{}' is not an absolute path", path));
    }
    if !self.precache.contains(&self.offline_fallback) {
      return Err(eyre!(
        "offline_fallback '{}' must be listed in precache",
        self.offline_fallback
      ));
    }
    Ok(())
  }

  /// Resolve an app-relative path (or absolute URL) against the origin.
  pub fn resolve(&self, path: &str) -> Result<Url> {
    self
      .origin
      .join(path)
      .map_err(|e| eyre!("Invalid URL '{}': {}", path, e))
  }

  pub fn partition(&self, purpose: Purpose) -> PartitionName {
    PartitionName::new(&self.cache_prefix, purpose, &self.version)
  }

  pub fn periodic_sync_interval(&self) -> Duration {
    Duration::from_secs(self.periodic_sync_secs.max(1))
  }

  /// All sync tags, deduplicated: route tags in config order, then the default.
  pub fn sync_tags(&self) -> Vec<String> {
    let mut tags: Vec<String> = Vec::new();
    let route_tags = self.sync_routes.iter().map(|route| &route.tag);
    for tag in route_tags.chain(std::iter::once(&self.default_sync_tag)) {
      if !tags.contains(tag) {
        tags.push(tag.clone());
      }
    }
    tags
  }
}
