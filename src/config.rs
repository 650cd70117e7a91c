use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::key::{CacheKey, Segment};
use crate::retry::{RetryPolicy, DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_CAP, DEFAULT_MAX_RETRIES};

const DEFAULT_STALE_TIME_MS: u64 = 0;
const DEFAULT_GC_TIME_MS: u64 = 5 * 60 * 1000;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub logging: LoggingConfig,
}

/// Engine configuration. Every field has a default.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Freshness window applied when no key class matches
  pub stale_time_ms: u64,
  /// How long an unobserved entry survives before eviction
  pub gc_time_ms: u64,
  pub max_retries: u32,
  pub backoff_base_ms: u64,
  pub backoff_cap_ms: u64,
  /// Per key-class overrides; the longest matching prefix wins
  pub key_classes: Vec<KeyClass>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      stale_time_ms: DEFAULT_STALE_TIME_MS,
      gc_time_ms: DEFAULT_GC_TIME_MS,
      max_retries: DEFAULT_MAX_RETRIES,
      backoff_base_ms: DEFAULT_BACKOFF_BASE.as_millis() as u64,
      backoff_cap_ms: DEFAULT_BACKOFF_CAP.as_millis() as u64,
      key_classes: Vec::new(),
    }
  }
}

/// Timing overrides for every key under `prefix`.
#[derive(Debug, Clone, Deserialize)]
pub struct KeyClass {
  pub prefix: Vec<Segment>,
  pub stale_time_ms: Option<u64>,
  pub gc_time_ms: Option<u64>,
}

/// Resolved timings for one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
  pub stale_time: Duration,
  pub gc_time: Duration,
}

impl CacheConfig {
  pub fn retry_policy(&self) -> RetryPolicy {
    RetryPolicy {
      max_retries: self.max_retries,
      backoff_base: Duration::from_millis(self.backoff_base_ms),
      backoff_cap: Duration::from_millis(self.backoff_cap_ms),
    }
  }

  /// Add a key-class override.
  pub fn with_key_class(
    mut self,
    prefix: CacheKey,
    stale_time: Option<Duration>,
    gc_time: Option<Duration>,
  ) -> Self {
    self.key_classes.push(KeyClass {
      prefix: prefix.segments().to_vec(),
      stale_time_ms: stale_time.map(|d| d.as_millis() as u64),
      gc_time_ms: gc_time.map(|d| d.as_millis() as u64),
    });
    self
  }

  /// Timings for `key`: global defaults, overridden field by field by the
  /// longest key class whose prefix matches.
  pub fn timings_for(&self, key: &CacheKey) -> Timings {
    let class = self
      .key_classes
      .iter()
      .filter(|class| key.segments().starts_with(&class.prefix))
      .max_by_key(|class| class.prefix.len());

    let stale_ms = class
      .and_then(|c| c.stale_time_ms)
      .unwrap_or(self.stale_time_ms);
    let gc_ms = class.and_then(|c| c.gc_time_ms).unwrap_or(self.gc_time_ms);

    Timings {
      stale_time: Duration::from_millis(stale_ms),
      gc_time: Duration::from_millis(gc_ms),
    }
  }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
  #[default]
  Pretty,
  Json,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
  /// Filter directive used when RUST_LOG is unset
  pub level: String,
  pub format: LogFormat,
  /// Write logs to a daily rolling file in this directory instead of stderr
  pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      format: LogFormat::Pretty,
      directory: None,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./querycache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/querycache/config.yaml
  ///
  /// With no explicit path and no file found, defaults are used.
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
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("querycache.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("querycache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache_key;

  #[test]
  fn test_defaults() {
    let config = CacheConfig::default();
    let timings = config.timings_for(&cache_key!["anything"]);
    assert_eq!(timings.stale_time, Duration::ZERO);
    assert_eq!(timings.gc_time, Duration::from_secs(300));
    assert_eq!(config.retry_policy(), RetryPolicy::default());
  }

  #[test]
  fn test_parse_yaml() {
    let yaml = r#"
cache:
  gc_time_ms: 60000
  max_retries: 2
  key_classes:
    - prefix: [families]
      stale_time_ms: 300000
    - prefix: [families, members]
      stale_time_ms: 30000
      gc_time_ms: 10000
    - prefix: [players, 7]
      stale_time_ms: 1
logging:
  level: debug
  format: json
"#;
    let config = Config::parse(yaml).unwrap();
    assert_eq!(config.logging.level, "debug");
    assert_eq!(config.logging.format, LogFormat::Json);
    assert_eq!(config.cache.max_retries, 2);
    assert_eq!(config.cache.backoff_base_ms, 1000);

    let detail = config.cache.timings_for(&cache_key!["families", "detail", "F1"]);
    assert_eq!(detail.stale_time, Duration::from_secs(300));
    assert_eq!(detail.gc_time, Duration::from_secs(60));

    let members = config.cache.timings_for(&cache_key!["families", "members", "F1"]);
    assert_eq!(members.stale_time, Duration::from_secs(30));
    assert_eq!(members.gc_time, Duration::from_secs(10));

    let player = config.cache.timings_for(&cache_key!["players", 7, "stats"]);
    assert_eq!(player.stale_time, Duration::from_millis(1));

    let other = config.cache.timings_for(&cache_key!["players", "7"]);
    assert_eq!(other.stale_time, Duration::ZERO);
  }

  #[test]
  fn test_empty_document_uses_defaults() {
    let config = Config::parse("{}").unwrap();
    assert_eq!(config.cache.gc_time_ms, DEFAULT_GC_TIME_MS);
    assert_eq!(config.logging.format, LogFormat::Pretty);
  }

  #[test]
  fn test_example_config_parses() {
    let config = Config::parse(include_str!("../querycache.example.yaml")).unwrap();
    assert_eq!(config.cache.key_classes.len(), 2);
    let members = config.cache.timings_for(&cache_key!["families", "members", "F1"]);
    assert_eq!(members.stale_time, Duration::from_secs(60));
    assert_eq!(members.gc_time, Duration::from_secs(600));
  }

  #[test]
  fn test_missing_explicit_path_is_error() {
    let err = Config::load(Some(Path::new("/definitely/not/here.yaml"))).unwrap_err();
    assert!(err.to_string().contains("Config file not found"));
  }

  #[test]
  fn test_with_key_class() {
    let config = CacheConfig::default().with_key_class(
      cache_key!["families"],
      Some(Duration::from_secs(300)),
      None,
    );
    let timings = config.timings_for(&cache_key!["families", "detail", "F1"]);
    assert_eq!(timings.stale_time, Duration::from_secs(300));
    assert_eq!(timings.gc_time, Duration::from_secs(300));
  }
}
