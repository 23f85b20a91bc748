use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  pub server: ServerConfig,
  pub batching: BatchingConfig,
  pub retry: RetryConfig,
  pub cache: CacheConfig,
  pub reconcile: ReconcileConfig,
  /// Directory holding the database and log files (defaults to $XDG_DATA_HOME/inkwell)
  pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
  /// Origin of the journal server; requests to other origins pass through untouched
  pub url: String,
  /// Path prefix of API routes (network-first)
  pub api_prefix: String,
  /// Path probed to confirm reachability before trusting an online event
  pub health_path: String,
  /// Path accepting batched writes, relative to the server url
  pub batch_path: String,
  pub request_timeout_ms: u64,
}

impl Default for ServerConfig {
  fn default() -> Self {
    Self {
      url: "http://localhost:3000".to_string(),
      api_prefix: "/api/".to_string(),
      health_path: "/api/health".to_string(),
      batch_path: "/api/entries/batch".to_string(),
      request_timeout_ms: 10_000,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BatchingConfig {
  pub max_batch_size: usize,
  pub max_wait_ms: u64,
}

impl Default for BatchingConfig {
  fn default() -> Self {
    Self {
      max_batch_size: 10,
      max_wait_ms: 100,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
  pub max_retries: u32,
  pub base_wait_ms: u64,
  pub cap_wait_ms: u64,
}

impl Default for RetryConfig {
  fn default() -> Self {
    Self {
      max_retries: 3,
      base_wait_ms: 1_000,
      cap_wait_ms: 30_000,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Generation tag embedded in every cache partition name
  pub generation: String,
  /// Same-origin paths downloaded into the static partition at install time
  pub precache: Vec<String>,
  /// Path suffixes served cache-first
  pub static_suffixes: Vec<String>,
  /// API routes whose successful responses are kept for offline reads
  pub cacheable_routes: Vec<String>,
  /// API routes that get a synthesized default payload when offline and uncached
  pub critical_reads: BTreeMap<String, serde_json::Value>,
  /// Body of the page served for failed navigations
  pub offline_page: String,
}

impl Default for CacheConfig {
  fn default() -> Self {
    let mut critical_reads = BTreeMap::new();
    critical_reads.insert(
      "/api/prompts/daily".to_string(),
      serde_json::json!({
        "prompt": "What is on your mind today?",
        "offline": true
      }),
    );

    Self {
      generation: "v1".to_string(),
      precache: Vec::new(),
      static_suffixes: [
        ".js", ".css", ".png", ".jpg", ".jpeg", ".svg", ".ico", ".webp", ".woff", ".woff2",
      ]
      .iter()
      .map(|s| s.to_string())
      .collect(),
      cacheable_routes: vec![
        "/api/prompts/daily".to_string(),
        "/api/entries".to_string(),
        "/api/user/profile".to_string(),
      ],
      critical_reads,
      offline_page: "<!doctype html><title>Offline</title>\
                     <h1>You are offline</h1>\
                     <p>Entries you write now will sync when you reconnect.</p>"
        .to_string(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
  /// How often failed entries are re-checked while online
  pub interval_secs: u64,
  /// How often the connectivity monitor probes the health endpoint
  pub probe_interval_secs: u64,
}

impl Default for ReconcileConfig {
  fn default() -> Self {
    Self {
      interval_secs: 30,
      probe_interval_secs: 15,
    }
  }
}

impl ServerConfig {
  pub fn request_timeout(&self) -> Duration {
    Duration::from_millis(self.request_timeout_ms)
  }
}

impl BatchingConfig {
  pub fn max_wait(&self) -> Duration {
    Duration::from_millis(self.max_wait_ms)
  }
}

impl ReconcileConfig {
  pub fn interval(&self) -> Duration {
    Duration::from_secs(self.interval_secs)
  }

  pub fn probe_interval(&self) -> Duration {
    Duration::from_secs(self.probe_interval_secs)
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./inkwell.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/inkwell/config.yaml
  ///
  /// Falls back to defaults when no file exists. Environment overrides are
  /// applied last.
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

    let mut config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Config::default(),
    };

    if let Ok(url) = std::env::var("INKWELL_SERVER_URL") {
      config.server.url = url;
    }

    config.validate()?;
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("inkwell.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("inkwell").join("config.yaml");
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
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    url::Url::parse(&self.server.url)
      .map_err(|e| eyre!("Invalid server url {}: {}", self.server.url, e))?;
    if self.batching.max_batch_size == 0 {
      return Err(eyre!("batching.max_batch_size must be at least 1"));
    }
    if self.retry.max_retries == 0 {
      return Err(eyre!("retry.max_retries must be at least 1"));
    }
    if self.cache.generation.trim().is_empty() {
      return Err(eyre!("cache.generation must not be empty"));
    }
    Ok(())
  }

  /// Directory holding the database and logs.
  pub fn data_dir(&self) -> Result<PathBuf> {
    if let Some(dir) = &self.data_dir {
      return Ok(dir.clone());
    }
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("inkwell"))
  }

  /// Get the API token from the environment, if one is set.
  pub fn api_token() -> Option<String> {
    std::env::var("INKWELL_API_TOKEN").ok()
  }
}
