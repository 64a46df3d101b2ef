use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub api: ApiConfig,
  #[serde(default)]
  pub realtime: RealtimeConfig,
  #[serde(default)]
  pub cache: CacheConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  /// Backend base url, e.g. http://127.0.0.1:8000
  pub url: String,
  /// Request timeout; no timeout when unset
  pub timeout_secs: Option<u64>,
}

impl ApiConfig {
  pub fn timeout(&self) -> Option<Duration> {
    self.timeout_secs.map(Duration::from_secs)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
  /// Websocket endpoint of the Pusher-compatible broadcaster
  pub url: String,
  pub app_key: String,
  /// Private channel authorization endpoint
  pub auth_endpoint: String,
  /// Channel name without the `private-` prefix; the user id is appended
  pub channel_prefix: String,
  /// Event carrying a newly created notification
  pub event: String,
}

impl Default for RealtimeConfig {
  fn default() -> Self {
    Self {
      url: "ws://127.0.0.1:6001".to_string(),
      app_key: "local-app-key".to_string(),
      auth_endpoint: "http://127.0.0.1:8000/broadcasting/auth".to_string(),
      channel_prefix: "notifications".to_string(),
      event: "NotificationCreated".to_string(),
    }
  }
}

impl RealtimeConfig {
  /// Private channel for one user id.
  pub fn channel_for(&self, user_id: u64) -> String {
    format!("private-{}.{}", self.channel_prefix, user_id)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Ticket lists older than this are refetched
  pub ticket_ttl_secs: u64,
  /// Most recent notifications kept in memory
  pub notification_limit: usize,
  /// Window in which repeated invalidations collapse into one
  pub debounce_ms: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      ticket_ttl_secs: 30,
      notification_limit: 10,
      debounce_ms: 300,
    }
  }
}

impl CacheConfig {
  pub fn ticket_ttl(&self) -> Duration {
    Duration::from_secs(self.ticket_ttl_secs)
  }

  pub fn debounce(&self) -> Duration {
    Duration::from_millis(self.debounce_ms)
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./tkt.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/tkt/config.yaml
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
        "No configuration file found. Create one at ~/.config/tkt/config.yaml\n\
                 with at least:\n\n  api:\n    url: http://127.0.0.1:8000"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("tkt.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("tkt").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self, serde_yaml::Error> {
    serde_yaml::from_str(contents)
  }

  /// Login email from the environment (TKT_EMAIL).
  pub fn get_email() -> Result<String> {
    std::env::var("TKT_EMAIL").map_err(|_| eyre!("No email given. Pass --email or set TKT_EMAIL."))
  }

  /// Login password from the environment (TKT_PASSWORD).
  pub fn get_password() -> Result<String> {
    std::env::var("TKT_PASSWORD")
      .map_err(|_| eyre!("No password given. Pass --password or set TKT_PASSWORD."))
  }
}
