//! Push payloads turned into notifications, and notification taps routed back to a page.

use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use crate::clients::ClientRegistry;
use crate::config::NotificationConfig;
use crate::host::{Host, HostCommand};

/// A parsed push message. Ephemeral; never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationPayload {
  pub title: String,
  pub body: String,
  pub icon: String,
  /// Opaque routing target, handed back to the page on tap
  pub target: String,
}

#[derive(Debug, Deserialize)]
struct RawPayload {
  title: Option<String>,
  body: Option<String>,
  icon: Option<String>,
  url: Option<String>,
  #[serde(default)]
  data: Option<RawData>,
}

#[derive(Debug, Deserialize)]
struct RawData {
  url: Option<String>,
}

impl NotificationPayload {
  /// Parse a JSON push payload.
  ///
  /// Anything that is not a JSON object degrades to a notification with the
  /// default title and the raw text as body. The bool is true when degraded.
  pub fn parse(data: &[u8], defaults: &NotificationConfig) -> (Self, bool) {
    match serde_json::from_slice::<RawPayload>(data) {
      Ok(raw) => {
        let target = raw
          .url
          .or_else(|| raw.data.and_then(|d| d.url))
          .unwrap_or_else(|| "/".to_string());
        let payload = Self {
          title: raw.title.unwrap_or_else(|| defaults.default_title.clone()),
          body: raw.body.unwrap_or_default(),
          icon: raw.icon.unwrap_or_else(|| defaults.icon.clone()),
          target,
        };
        (payload, false)
      }
      Err(_) => {
        let payload = Self {
          title: defaults.default_title.clone(),
          body: String::from_utf8_lossy(data).trim().to_string(),
          icon: defaults.icon.clone(),
          target: "/".to_string(),
        };
        (payload, true)
      }
    }
  }
}

/// What a notification tap led to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClickOutcome {
  Focused { client_id: String },
  Opened { url: Url },
}

pub struct NotificationDispatcher {
  host: Arc<dyn Host>,
  clients: Arc<ClientRegistry>,
  origin: Url,
  defaults: NotificationConfig,
  next_id: AtomicU64,
}

impl NotificationDispatcher {
  pub fn new(
    host: Arc<dyn Host>,
    clients: Arc<ClientRegistry>,
    origin: Url,
    defaults: NotificationConfig,
  ) -> Self {
    Self {
      host,
      clients,
      origin,
      defaults,
      next_id: AtomicU64::new(1),
    }
  }

  /// Show a notification for an inbound push. Returns the notification id.
  pub fn on_push(&self, data: &[u8]) -> String {
    let (payload, degraded) = NotificationPayload::parse(data, &self.defaults);
    if degraded {
      warn!(len = data.len(), "push payload is not JSON, showing generic notification");
    }

    let id = format!("notification-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
    info!(id = %id, title = %payload.title, target = %payload.target, "showing notification");

    self.host.emit(HostCommand::ShowNotification {
      id: id.clone(),
      title: payload.title,
      body: payload.body,
      icon: payload.icon,
      data: json!({ "url": payload.target }),
    });
    id
  }

  /// Close the tapped notification and bring its target page forward.
  ///
  /// Focuses an open page already showing the target, otherwise opens one.
  pub fn on_click(&self, notification_id: &str, data: &Value) -> Result<ClickOutcome> {
    self.host.emit(HostCommand::CloseNotification {
      id: notification_id.to_string(),
    });

    let target = data.get("url").and_then(Value::as_str).unwrap_or("/");
    let url = self
      .origin
      .join(target)
      .or_else(|_| self.origin.join("/"))
      .map_err(|e| eyre!("Invalid notification target '{}': {}", target, e))?;

    if let Some(client) = self.clients.find_by_url(&url)? {
      debug!(client = %client.id, url = %url, "focusing existing page");
      self.host.emit(HostCommand::FocusClient {
        client_id: client.id.clone(),
      });
      return Ok(ClickOutcome::Focused {
        client_id: client.id,
      });
    }

    debug!(url = %url, "opening new page");
    self.host.emit(HostCommand::OpenWindow {
      url: url.to_string(),
    });
    Ok(ClickOutcome::Opened { url })
  }
}
