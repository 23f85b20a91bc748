//! Core types for the caching system.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Cache partition a response belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheClass {
  /// Populated at install time, immutable until the next generation
  Static,
  /// Opportunistic copies of pages and other same-origin reads
  Dynamic,
  /// Opportunistic copies of allow-listed API reads
  Api,
}

impl CacheClass {
  pub const ALL: [CacheClass; 3] = [CacheClass::Static, CacheClass::Dynamic, CacheClass::Api];

  pub fn as_str(&self) -> &'static str {
    match self {
      CacheClass::Static => "static",
      CacheClass::Dynamic => "dynamic",
      CacheClass::Api => "api",
    }
  }
}

/// A versioned set of cache partitions, superseded wholesale on deploy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheGeneration {
  tag: String,
}

impl CacheGeneration {
  pub fn new(tag: &str) -> Self {
    Self {
      tag: tag.trim().to_string(),
    }
  }

  pub fn tag(&self) -> &str {
    &self.tag
  }

  /// Name of the partition for a class in this generation.
  pub fn partition(&self, class: CacheClass) -> String {
    format!("inkwell-{}-{}", class.as_str(), self.tag)
  }

  /// Every partition name this generation owns.
  pub fn known_partitions(&self) -> Vec<String> {
    CacheClass::ALL.iter().map(|c| self.partition(*c)).collect()
  }
}

/// Result from an intercepted request, including metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Fresh data from the network.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Request was not intercepted.
  pub fn passthrough(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Passthrough,
      cached_at: None,
    }
  }

  /// Served from cache without touching the network.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
      cached_at: Some(cached_at),
    }
  }

  /// Network failed, serving the last cached copy.
  pub fn offline(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at: Some(cached_at),
    }
  }

  /// Network failed and nothing was cached, serving a synthesized default.
  pub fn fallback(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Fallback,
      cached_at: None,
    }
  }
}

/// Indicates where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheSource {
  /// Not intercepted
  Passthrough,
  /// Fresh data from network
  Network,
  /// Cache hit on a cache-first route
  Cache,
  /// Network unavailable, serving cached data
  Offline,
  /// Network unavailable and uncached, serving a local default
  Fallback,
}

impl std::fmt::Display for CacheSource {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let s = match self {
      CacheSource::Passthrough => "passthrough",
      CacheSource::Network => "network",
      CacheSource::Cache => "cache",
      CacheSource::Offline => "offline",
      CacheSource::Fallback => "fallback",
    };
    f.write_str(s)
  }
}
