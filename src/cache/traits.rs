//! Core types for the cache partition store.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::net::{Request, Response};

/// What a partition holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Purpose {
  /// Fetched proactively at install time (and by CACHE_URLS)
  Precache,
  /// Populated opportunistically by successful network-first requests
  Runtime,
}

impl Purpose {
  pub fn as_str(&self) -> &'static str {
    match self {
      Purpose::Precache => "precache",
      Purpose::Runtime => "runtime",
    }
  }
}

/// Name of a versioned partition: `{prefix}-{purpose}-{version}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionName {
  pub prefix: String,
  pub purpose: Purpose,
  pub version: String,
}

impl PartitionName {
  pub fn new(prefix: &str, purpose: Purpose, version: &str) -> Self {
    Self {
      prefix: prefix.to_string(),
      purpose,
      version: version.to_string(),
    }
  }
}

impl fmt::Display for PartitionName {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}-{}-{}", self.prefix, self.purpose.as_str(), self.version)
  }
}

/// Normalized cache key for a non-mutating request.
///
/// SHA-256 over method and fragment-less URL, for stable fixed-length keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
  /// Mutating requests are never cached and have no key.
  pub fn for_request(request: &Request) -> Option<Self> {
    if request.is_mutating() {
      return None;
    }
    let mut url = request.url.clone();
    url.set_fragment(None);

    let mut hasher = Sha256::new();
    hasher.update(request.method.as_bytes());
    hasher.update(b" ");
    hasher.update(url.as_str().as_bytes());
    Some(Self(hex::encode(hasher.finalize())))
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

/// Result of a strategy, including where the response came from.
#[derive(Debug, Clone)]
pub struct CacheResult {
  pub response: Response,
  pub source: CacheSource,
}

impl CacheResult {
  pub fn from_network(response: Response) -> Self {
    Self {
      response,
      source: CacheSource::Network,
    }
  }

  pub fn from_cache(response: Response) -> Self {
    Self {
      response,
      source: CacheSource::Cache,
    }
  }

  pub fn offline(response: Response) -> Self {
    Self {
      response,
      source: CacheSource::OfflineFallback,
    }
  }
}

/// Indicates where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheSource {
  /// Fresh from the network
  Network,
  /// Served from a cache partition
  Cache,
  /// Network and cache both missed; the designated offline page
  OfflineFallback,
}
