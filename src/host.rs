//! Commands the worker sends to the host platform.

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::cache::CacheSource;
use crate::lifecycle::LifecycleState;
use crate::net::Response;

/// Outbound command to the platform hosting the worker.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostCommand {
  ShowNotification {
    id: String,
    title: String,
    body: String,
    icon: String,
    /// Opaque routing data handed back on click
    data: Value,
  },
  CloseNotification {
    id: String,
  },
  FocusClient {
    client_id: String,
  },
  OpenWindow {
    url: String,
  },
  StateChanged {
    state: LifecycleState,
  },
  FetchResponse {
    id: String,
    source: CacheSource,
    response: Response,
  },
  /// The platform should perform its default handling
  FetchDeclined {
    id: String,
  },
  FetchFailed {
    id: String,
    error: String,
  },
  MessageHandled {
    kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
  },
}

pub trait Host: Send + Sync {
  fn emit(&self, command: HostCommand);
}

/// Host that forwards commands into a channel drained by the frontend.
#[derive(Clone)]
pub struct ChannelHost {
  tx: mpsc::UnboundedSender<HostCommand>,
}

impl ChannelHost {
  pub fn new() -> (Self, mpsc::UnboundedReceiver<HostCommand>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Self { tx }, rx)
  }
}

impl Host for ChannelHost {
  fn emit(&self, command: HostCommand) {
    // Ignore send errors - the frontend may already be gone
    let _ = self.tx.send(command);
  }
}
