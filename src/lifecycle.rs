//! Install / activate state machine and version-based partition cleanup.

use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};
use url::Url;

use crate::cache::{CacheKey, CacheLayer, CacheStorage};
use crate::host::{Host, HostCommand};
use crate::net::Request;

/// Worker lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
  /// Precaching the manifest
  Installing,
  /// Installed, waiting for open pages to go away (or SKIP_WAITING)
  Waiting,
  /// Deleting stale partitions
  Activating,
  /// Intercepting requests
  Active,
  /// Install failed; never intercepts
  Redundant,
}

pub struct Lifecycle<S: CacheStorage> {
  state: Mutex<LifecycleState>,
  skip_waiting: AtomicBool,
  layer: CacheLayer<S>,
  manifest: Vec<Url>,
  host: Arc<dyn Host>,
}

impl<S: CacheStorage> Lifecycle<S> {
  pub fn new(layer: CacheLayer<S>, manifest: Vec<Url>, host: Arc<dyn Host>) -> Self {
    Self {
      state: Mutex::new(LifecycleState::Installing),
      skip_waiting: AtomicBool::new(false),
      layer,
      manifest,
      host,
    }
  }

  pub fn state(&self) -> Result<LifecycleState> {
    self
      .state
      .lock()
      .map(|s| *s)
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  pub fn is_active(&self) -> bool {
    matches!(self.state(), Ok(LifecycleState::Active))
  }

  fn set_state(&self, next: LifecycleState) -> Result<()> {
    let prev = {
      let mut state = self
        .state
        .lock()
        .map_err(|e| eyre!("Lock poisoned: {}", e))?;
      std::mem::replace(&mut *state, next)
    };
    if prev != next {
      info!(from = ?prev, to = ?next, "lifecycle transition");
      self.host.emit(HostCommand::StateChanged { state: next });
    }
    Ok(())
  }

  /// Whether every manifest entry is already in the current precache partition.
  pub fn is_installed(&self) -> Result<bool> {
    let storage = self.layer.storage();
    let partition = self.layer.precache_partition();
    for url in &self.manifest {
      let request = Request::get(url.clone());
      let Some(key) = CacheKey::for_request(&request) else {
        continue;
      };
      if storage.match_entry(partition, &key)?.is_none() {
        return Ok(false);
      }
    }
    Ok(true)
  }

  /// Precache the whole manifest.
  ///
  /// A single unreachable asset fails the install and the worker becomes
  /// redundant; nothing from this attempt is kept.
  pub async fn install(&self) -> Result<usize> {
    if self.state()? != LifecycleState::Installing {
      return Err(eyre!("Cannot install from state {:?}", self.state()?));
    }
    self.host.emit(HostCommand::StateChanged {
      state: LifecycleState::Installing,
    });

    let partition = self.layer.precache_partition().to_string();
    match self.layer.precache_all(&partition, &self.manifest).await {
      Ok(count) => {
        info!(partition = %partition, count, "precache complete");
        self.set_state(LifecycleState::Waiting)?;
        Ok(count)
      }
      Err(e) => {
        error!(partition = %partition, error = %e, "install failed");
        self.set_state(LifecycleState::Redundant)?;
        Err(e)
      }
    }
  }

  /// Request activation without waiting for open pages to close.
  pub fn skip_waiting(&self) {
    self.skip_waiting.store(true, Ordering::SeqCst);
  }

  /// Activate if waiting and either no page is open or skip-waiting was requested.
  pub fn try_activate(&self, open_clients: usize) -> Result<bool> {
    if self.state()? != LifecycleState::Waiting {
      return Ok(false);
    }
    if open_clients > 0 && !self.skip_waiting.load(Ordering::SeqCst) {
      info!(open_clients, "waiting for open pages to close before activating");
      return Ok(false);
    }
    self.activate()?;
    Ok(true)
  }

  /// Finish installing without fetching: the current precache is already
  /// complete from an earlier run.
  pub fn restore(&self) -> Result<()> {
    if self.state()? != LifecycleState::Installing {
      return Err(eyre!("Cannot restore from state {:?}", self.state()?));
    }
    self.set_state(LifecycleState::Waiting)
  }

  /// Delete every partition that is not one of the current version's.
  ///
  /// Cleanup failures are logged and retried on the next activation; the
  /// worker still becomes active.
  fn activate(&self) -> Result<Vec<String>> {
    self.set_state(LifecycleState::Activating)?;

    let current: HashSet<&str> = [
      self.layer.precache_partition(),
      self.layer.runtime_partition(),
    ]
    .into_iter()
    .collect();

    let mut deleted = Vec::new();
    match self.layer.storage().partitions() {
      Ok(partitions) => {
        for name in partitions.iter().filter(|n| !current.contains(n.as_str())) {
          match self.layer.storage().delete_partition(name) {
            Ok(_) => {
              info!(partition = %name, "deleted stale partition");
              deleted.push(name.clone());
            }
            Err(e) => warn!(partition = %name, error = %e, "failed to delete stale partition"),
          }
        }
      }
      Err(e) => warn!(error = %e, "failed to list partitions during activation"),
    }

    self.set_state(LifecycleState::Active)?;
    Ok(deleted)
  }
}
