//! Request classification.
//!
//! First match wins:
//! 1. cross-origin - pass through, never cached
//! 2. mutating - sent to the network, queued for replay under the matching
//!    sync route's tag (or the default tag) if delivery fails
//! 3. API prefix or navigation - network-first
//! 4. everything else (static, build-versioned assets) - cache-first

use crate::config::{Config, SyncRoute};
use crate::net::Request;

/// How the worker handles an intercepted request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
  /// Decline; the platform performs its default handling
  PassThrough,
  /// Same-origin mutating request; queued under `tag` if delivery fails
  Replayable { tag: String },
  NetworkFirst,
  CacheFirst,
}

pub struct Router {
  origin: url::Origin,
  api_prefixes: Vec<String>,
  sync_routes: Vec<SyncRoute>,
  default_sync_tag: String,
}

impl Router {
  pub fn new(config: &Config) -> Self {
    Self {
      origin: config.origin.origin(),
      api_prefixes: config.api_prefixes.clone(),
      sync_routes: config.sync_routes.clone(),
      default_sync_tag: config.default_sync_tag.clone(),
    }
  }

  pub fn classify(&self, request: &Request) -> Route {
    if request.url.origin() != self.origin {
      return Route::PassThrough;
    }

    let path = request.url.path();

    if request.is_mutating() {
      let tag = self
        .sync_routes
        .iter()
        .find(|route| path.starts_with(route.prefix.as_str()))
        .map_or(&self.default_sync_tag, |route| &route.tag);
      return Route::Replayable { tag: tag.clone() };
    }

    if request.navigate || self.api_prefixes.iter().any(|p| path.starts_with(p.as_str())) {
      return Route::NetworkFirst;
    }

    Route::CacheFirst
  }
}
