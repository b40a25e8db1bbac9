//! Shared fakes for unit tests.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use url::Url;

use crate::config::Config;
use crate::host::{Host, HostCommand};
use crate::net::{Request, Response, Transport};

pub const ORIGIN: &str = "https://app.test";

/// Resolve a path against the test origin.
pub fn url(path: &str) -> Url {
  Url::parse(ORIGIN).unwrap().join(path).unwrap()
}

pub fn test_config() -> Config {
  Config::from_yaml(
    r#"
origin: https://app.test
version: v2
cache_prefix: app
precache: ["/", "/offline"]
offline_fallback: /offline
api_prefixes: ["/api/"]
sync_routes:
  - { prefix: /api/bugs, tag: sync-bugs }
  - { prefix: /api/scans, tag: sync-scans }
max_replay_attempts: 3
periodic_sync_secs: 60
"#,
  )
  .unwrap()
}

#[derive(Default)]
struct MockState {
  responses: HashMap<String, Response>,
  calls: HashMap<String, usize>,
  successes: HashMap<String, usize>,
  history: Vec<String>,
}

/// In-memory network keyed by URL path.
///
/// Unregistered paths and any request made while offline fail delivery.
pub struct MockTransport {
  state: Mutex<MockState>,
  online: AtomicBool,
  delay: Mutex<Option<Duration>>,
}

impl MockTransport {
  pub fn new() -> Self {
    Self {
      state: Mutex::new(MockState::default()),
      online: AtomicBool::new(true),
      delay: Mutex::new(None),
    }
  }

  pub fn respond(&self, path: &str, response: Response) {
    self
      .state
      .lock()
      .unwrap()
      .responses
      .insert(path.to_string(), response);
  }

  pub fn set_online(&self, online: bool) {
    self.online.store(online, Ordering::SeqCst);
  }

  pub fn set_delay(&self, delay: Duration) {
    *self.delay.lock().unwrap() = Some(delay);
  }

  /// Every fetch attempted for `path`, delivered or not.
  pub fn calls(&self, path: &str) -> usize {
    *self.state.lock().unwrap().calls.get(path).unwrap_or(&0)
  }

  /// Fetches for `path` that were delivered and got a 2xx.
  pub fn successes(&self, path: &str) -> usize {
    *self.state.lock().unwrap().successes.get(path).unwrap_or(&0)
  }

  /// `"METHOD /path"` for every attempted fetch, in order.
  pub fn history(&self) -> Vec<String> {
    self.state.lock().unwrap().history.clone()
  }
}

#[async_trait]
impl Transport for MockTransport {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    let path = request.url.path().to_string();
    {
      let mut state = self.state.lock().unwrap();
      *state.calls.entry(path.clone()).or_default() += 1;
      state.history.push(format!("{} {}", request.method, path));
    }

    let delay = *self.delay.lock().unwrap();
    if let Some(delay) = delay {
      tokio::time::sleep(delay).await;
    }

    if !self.online.load(Ordering::SeqCst) {
      return Err(eyre!("network unreachable: {}", request.url));
    }

    let mut state = self.state.lock().unwrap();
    let response = state
      .responses
      .get(&path)
      .cloned()
      .ok_or_else(|| eyre!("connection refused: {}", request.url))?;
    if response.is_success() {
      *state.successes.entry(path).or_default() += 1;
    }
    Ok(response)
  }
}

/// Host that records every command it is sent.
#[derive(Default)]
pub struct RecordingHost {
  commands: Mutex<Vec<HostCommand>>,
}

impl RecordingHost {
  pub fn commands(&self) -> Vec<HostCommand> {
    self.commands.lock().unwrap().clone()
  }
}

impl Host for RecordingHost {
  fn emit(&self, command: HostCommand) {
    self.commands.lock().unwrap().push(command);
  }
}
