//! Cache layer that implements the read strategies on top of a storage backend.

use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;

use super::storage::CacheStorage;
use super::traits::{CacheKey, CacheResult};
use crate::net::{Request, Response, Transport};

/// Cache layer that manages caching logic and network fetching.
///
/// Sits between the router and the network. The precache partition is the
/// primary store for cache-first assets; the runtime partition collects
/// network-first responses.
pub struct CacheLayer<S: CacheStorage> {
  storage: Arc<S>,
  transport: Arc<dyn Transport>,
  precache: String,
  runtime: String,
  offline_url: Url,
}

impl<S: CacheStorage> CacheLayer<S> {
  pub fn new(
    storage: Arc<S>,
    transport: Arc<dyn Transport>,
    precache: String,
    runtime: String,
    offline_url: Url,
  ) -> Self {
    Self {
      storage,
      transport,
      precache,
      runtime,
      offline_url,
    }
  }

  pub fn storage(&self) -> &Arc<S> {
    &self.storage
  }

  pub fn precache_partition(&self) -> &str {
    &self.precache
  }

  pub fn runtime_partition(&self) -> &str {
    &self.runtime
  }

  /// Serve from the primary partition; consult the network only on a miss.
  ///
  /// 1. Hit - return immediately, no network call
  /// 2. Miss - fetch, store 2xx responses, return
  /// 3. Network failure - offline page for navigations, error otherwise
  pub async fn cache_first(&self, request: &Request) -> Result<CacheResult> {
    match self.lookup(&self.precache, request) {
      Ok(Some(cached)) => {
        debug!(url = %request.url, "cache-first hit");
        return Ok(CacheResult::from_cache(cached));
      }
      Ok(None) => debug!(url = %request.url, "cache-first miss"),
      Err(e) if request.navigate => {
        warn!(url = %request.url, error = %e, "cache lookup failed, trying network");
      }
      Err(e) => return Err(e),
    }

    match self.transport.fetch(request).await {
      Ok(response) => {
        self.store(&self.precache, request, &response);
        Ok(CacheResult::from_network(response))
      }
      Err(e) => self.fail(request, e),
    }
  }

  /// Always try the network; fall back to cached copies only once it has failed.
  pub async fn network_first(&self, request: &Request) -> Result<CacheResult> {
    let network_error = match self.transport.fetch(request).await {
      Ok(response) => {
        self.store(&self.runtime, request, &response);
        return Ok(CacheResult::from_network(response));
      }
      Err(e) => e,
    };

    debug!(url = %request.url, error = %network_error, "network-first falling back to cache");

    for partition in [&self.runtime, &self.precache] {
      match self.lookup(partition, request) {
        Ok(Some(cached)) => return Ok(CacheResult::from_cache(cached)),
        Ok(None) => {}
        Err(e) if request.navigate => {
          warn!(url = %request.url, error = %e, "cache lookup failed");
        }
        Err(e) => return Err(e),
      }
    }

    self.fail(request, network_error)
  }

  /// The designated offline page from the precache partition.
  pub fn offline_fallback(&self) -> Result<Option<Response>> {
    self.lookup(&self.precache, &Request::get(self.offline_url.clone()))
  }

  /// Fetch every URL and store them all into `partition`, or store nothing.
  ///
  /// Any network failure or non-2xx status aborts the whole batch.
  pub async fn precache_all(&self, partition: &str, urls: &[Url]) -> Result<usize> {
    let mut entries = Vec::with_capacity(urls.len());

    for url in urls {
      let request = Request::get(url.clone());
      let response = self
        .transport
        .fetch(&request)
        .await
        .map_err(|e| eyre!("Failed to precache {}: {}", url, e))?;

      if !response.is_success() {
        return Err(eyre!(
          "Failed to precache {}: status {}",
          url,
          response.status
        ));
      }
      entries.push((request, response));
    }

    self.storage.put_entries(partition, &entries)?;
    Ok(entries.len())
  }

  fn lookup(&self, partition: &str, request: &Request) -> Result<Option<Response>> {
    match CacheKey::for_request(request) {
      Some(key) => self.storage.match_entry(partition, &key),
      None => Ok(None),
    }
  }

  /// Opportunistic write; failures are logged, never surfaced.
  fn store(&self, partition: &str, request: &Request, response: &Response) {
    if request.is_mutating() || !response.is_success() {
      return;
    }
    if let Err(e) = self.storage.put_entry(partition, request, response) {
      warn!(partition, url = %request.url, error = %e, "failed to write cache entry");
    }
  }

  /// Network and cache both failed.
  fn fail(&self, request: &Request, error: color_eyre::Report) -> Result<CacheResult> {
    if request.navigate {
      match self.offline_fallback() {
        Ok(Some(page)) => {
          debug!(url = %request.url, "serving offline fallback");
          return Ok(CacheResult::offline(page));
        }
        Ok(None) => warn!(url = %request.url, "offline fallback missing from precache"),
        Err(e) => warn!(url = %request.url, error = %e, "offline fallback lookup failed"),
      }
    }
    Err(error)
  }
}

impl<S: CacheStorage> Clone for CacheLayer<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      transport: Arc::clone(&self.transport),
      precache: self.precache.clone(),
      runtime: self.runtime.clone(),
      offline_url: self.offline_url.clone(),
    }
  }
}
