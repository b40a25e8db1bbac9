//! Imperative commands from the page.

use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use tracing::info;
use url::Url;

use crate::cache::{CacheLayer, CacheStorage};
use crate::lifecycle::{Lifecycle, LifecycleState};

/// A `{type, payload}` message posted by the page.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
  /// Activate now instead of waiting for every page to close
  SkipWaiting,
  /// Fetch these URLs into the precache partition
  CacheUrls { urls: Vec<String> },
  /// Delete every partition
  ClearCache,
}

impl ControlMessage {
  pub fn kind(&self) -> &'static str {
    match self {
      ControlMessage::SkipWaiting => "SKIP_WAITING",
      ControlMessage::CacheUrls { .. } => "CACHE_URLS",
      ControlMessage::ClearCache => "CLEAR_CACHE",
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlOutcome {
  State(LifecycleState),
  Cached(usize),
  Cleared(usize),
}

/// Executes control messages. Every command is idempotent.
pub struct ControlChannel<'a, S: CacheStorage> {
  pub lifecycle: &'a Lifecycle<S>,
  pub layer: &'a CacheLayer<S>,
  pub origin: &'a Url,
  pub open_clients: usize,
}

impl<S: CacheStorage> ControlChannel<'_, S> {
  pub async fn handle(&self, message: ControlMessage) -> Result<ControlOutcome> {
    match message {
      ControlMessage::SkipWaiting => {
        self.lifecycle.skip_waiting();
        self.lifecycle.try_activate(self.open_clients)?;
        Ok(ControlOutcome::State(self.lifecycle.state()?))
      }
      ControlMessage::CacheUrls { urls } => {
        let urls = urls
          .iter()
          .map(|u| {
            self
              .origin
              .join(u)
              .map_err(|e| eyre!("Invalid URL '{}': {}", u, e))
          })
          .collect::<Result<Vec<Url>>>()?;
        let partition = self.layer.precache_partition().to_string();
        let count = self.layer.precache_all(&partition, &urls).await?;
        info!(partition = %partition, count, "cached URLs on request");
        Ok(ControlOutcome::Cached(count))
      }
      ControlMessage::ClearCache => {
        let storage = self.layer.storage();
        let mut cleared = 0;
        for name in storage.partitions()? {
          if storage.delete_partition(&name)? {
            cleared += 1;
          }
        }
        info!(cleared, "cleared all partitions");
        Ok(ControlOutcome::Cleared(cleared))
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStorage;
  use crate::db::Database;
  use crate::net::{Request, Response};
  use crate::testing::{url, MockTransport, RecordingHost, ORIGIN};
  use std::sync::Arc;

  fn parts() -> (Lifecycle<SqliteStorage>, CacheLayer<SqliteStorage>, Arc<MockTransport>) {
    let storage = Arc::new(SqliteStorage::new(Arc::new(
      Database::open_in_memory().unwrap(),
    )));
    let transport = Arc::new(MockTransport::new());
    transport.respond("/", Response::new(200, "home"));
    let layer = CacheLayer::new(
      storage,
      transport.clone(),
      "app-precache-v2".to_string(),
      "app-runtime-v2".to_string(),
      url("/offline"),
    );
    let lifecycle = Lifecycle::new(
      layer.clone(),
      vec![url("/")],
      Arc::new(RecordingHost::default()),
    );
    (lifecycle, layer, transport)
  }

  #[test]
  fn test_message_wire_format() {
    let skip: ControlMessage = serde_json::from_str(r#"{"type":"SKIP_WAITING"}"#).unwrap();
    assert_eq!(skip, ControlMessage::SkipWaiting);

    let cache: ControlMessage =
      serde_json::from_str(r#"{"type":"CACHE_URLS","payload":{"urls":["/a.js"]}}"#).unwrap();
    assert_eq!(
      cache,
      ControlMessage::CacheUrls {
        urls: vec!["/a.js".to_string()]
      }
    );

    assert!(serde_json::from_str::<ControlMessage>(r#"{"type":"REBOOT"}"#).is_err());
  }

  #[tokio::test]
  async fn test_skip_waiting_is_idempotent() {
    let (lifecycle, layer, _) = parts();
    lifecycle.install().await.unwrap();
    let origin = Url::parse(ORIGIN).unwrap();
    let channel = ControlChannel {
      lifecycle: &lifecycle,
      layer: &layer,
      origin: &origin,
      open_clients: 3,
    };

    for _ in 0..2 {
      assert_eq!(
        channel.handle(ControlMessage::SkipWaiting).await.unwrap(),
        ControlOutcome::State(LifecycleState::Active)
      );
    }
  }

  #[tokio::test]
  async fn test_cache_urls_and_clear() {
    let (lifecycle, layer, transport) = parts();
    transport.respond("/app.js", Response::new(200, "js"));
    let origin = Url::parse(ORIGIN).unwrap();
    let channel = ControlChannel {
      lifecycle: &lifecycle,
      layer: &layer,
      origin: &origin,
      open_clients: 0,
    };
    let message = ControlMessage::CacheUrls {
      urls: vec!["/app.js".to_string()],
    };

    channel.handle(message.clone()).await.unwrap();
    channel.handle(message).await.unwrap();
    assert_eq!(layer.storage().entry_count("app-precache-v2").unwrap(), 1);

    layer
      .storage()
      .put_entry("app-runtime-v2", &Request::get(url("/api/x")), &Response::new(200, ""))
      .unwrap();
    assert_eq!(
      channel.handle(ControlMessage::ClearCache).await.unwrap(),
      ControlOutcome::Cleared(2)
    );
    assert_eq!(
      channel.handle(ControlMessage::ClearCache).await.unwrap(),
      ControlOutcome::Cleared(0)
    );
    assert!(layer.storage().partitions().unwrap().is_empty());
  }
}
