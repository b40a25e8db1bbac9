//! Open page instances the worker controls.

use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use std::sync::Mutex;
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Client {
  pub id: String,
  pub url: Url,
}

/// Registry of open pages, in the order they were opened.
#[derive(Default)]
pub struct ClientRegistry {
  clients: Mutex<Vec<Client>>,
}

impl ClientRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Vec<Client>>> {
    self.clients.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Register a page. Re-opening a known id just updates its URL.
  pub fn open(&self, id: &str, url: Url) -> Result<()> {
    let mut clients = self.lock()?;
    match clients.iter_mut().find(|c| c.id == id) {
      Some(client) => client.url = url,
      None => clients.push(Client {
        id: id.to_string(),
        url,
      }),
    }
    Ok(())
  }

  pub fn navigate(&self, id: &str, url: Url) -> Result<()> {
    self.open(id, url)
  }

  /// Remove a page, returning how many remain.
  pub fn close(&self, id: &str) -> Result<usize> {
    let mut clients = self.lock()?;
    clients.retain(|c| c.id != id);
    Ok(clients.len())
  }

  /// First open page currently showing `url` (fragment ignored).
  pub fn find_by_url(&self, url: &Url) -> Result<Option<Client>> {
    let mut wanted = url.clone();
    wanted.set_fragment(None);

    let clients = self.lock()?;
    Ok(
      clients
        .iter()
        .find(|c| {
          let mut current = c.url.clone();
          current.set_fragment(None);
          current == wanted
        })
        .cloned(),
    )
  }

  pub fn len(&self) -> Result<usize> {
    Ok(self.lock()?.len())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::testing::url;

  #[test]
  fn test_open_navigate_close() {
    let registry = ClientRegistry::new();
    registry.open("tab-1", url("/")).unwrap();
    registry.open("tab-2", url("/bugs")).unwrap();
    registry.navigate("tab-1", url("/scans")).unwrap();

    assert_eq!(registry.len().unwrap(), 2);
    assert_eq!(
      registry.find_by_url(&url("/scans")).unwrap().unwrap().id,
      "tab-1"
    );
    assert!(registry.find_by_url(&url("/")).unwrap().is_none());

    assert_eq!(registry.close("tab-1").unwrap(), 1);
    assert_eq!(registry.close("tab-1").unwrap(), 1);
    assert_eq!(registry.close("tab-2").unwrap(), 0);
  }

  #[test]
  fn test_find_ignores_fragment() {
    let registry = ClientRegistry::new();
    registry.open("tab-1", url("/bugs/4#comments")).unwrap();
    assert!(registry.find_by_url(&url("/bugs/4")).unwrap().is_some());
  }
}
