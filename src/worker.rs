//! The single long-lived worker: one dispatcher for every inbound event.
//!
//! Lifecycle-affecting events are handled in arrival order by the event loop.
//! Fetches, pushes, replays and cache-filling control messages are spawned so
//! many can be in flight at once, each suspended on its own network or storage
//! I/O.

use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::cache::{CacheLayer, CacheResult, CacheStorage, Purpose, SqliteStorage};
use crate::clients::ClientRegistry;
use crate::config::Config;
use crate::control::{ControlChannel, ControlMessage, ControlOutcome};
use crate::db::Database;
use crate::host::Host;
use crate::lifecycle::{Lifecycle, LifecycleState};
use crate::net::{validate_request, Request, Transport};
use crate::push::{ClickOutcome, NotificationDispatcher};
use crate::queue::{QueueStorage, ReplayReport, RetryQueue, SqliteQueue};
use crate::router::{Route, Router};

/// Inbound event, one variant per entry point.
#[derive(Debug)]
pub enum WorkerEvent {
  Install,
  Activate,
  Fetch(Request),
  Push(Vec<u8>),
  NotificationClick { id: String, data: Value },
  Message(ControlMessage),
  /// Connectivity restored for one tag
  Sync { tag: String },
  /// Timer-driven replay for one tag
  PeriodicSync { tag: String },
  /// Connectivity restored; replay every tag
  Online,
  ClientOpened { id: String, url: Url },
  ClientNavigated { id: String, url: Url },
  ClientClosed { id: String },
}

impl WorkerEvent {
  /// Events that must be handled strictly in order. None of them wait on
  /// the network except `Install`, which runs before any traffic is served.
  fn is_ordered(&self) -> bool {
    matches!(
      self,
      WorkerEvent::Install
        | WorkerEvent::Activate
        | WorkerEvent::Message(ControlMessage::SkipWaiting)
        | WorkerEvent::ClientOpened { .. }
        | WorkerEvent::ClientNavigated { .. }
        | WorkerEvent::ClientClosed { .. }
    )
  }
}

/// Result of intercepting one request.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
  Respond(CacheResult),
  /// Pass-through: the platform handles the request as if no worker existed
  Decline,
}

#[derive(Debug)]
pub enum Outcome {
  Lifecycle(LifecycleState),
  Fetch(FetchOutcome),
  Notified(String),
  Click(ClickOutcome),
  Control(ControlOutcome),
  Replay(Vec<ReplayReport>),
  /// Event arrived before the worker was active
  Ignored,
  Done,
}

#[derive(Debug, Serialize)]
pub struct PartitionStatus {
  pub name: String,
  pub entries: usize,
}

#[derive(Debug, Serialize)]
pub struct QueueStatus {
  pub tag: String,
  pub pending: usize,
}

#[derive(Debug, Serialize)]
pub struct Status {
  pub version: String,
  pub state: LifecycleState,
  /// Current precache holds the whole manifest
  pub installed: bool,
  pub partitions: Vec<PartitionStatus>,
  pub queues: Vec<QueueStatus>,
}

pub struct ServiceWorker {
  config: Config,
  router: Router,
  layer: CacheLayer<SqliteStorage>,
  lifecycle: Lifecycle<SqliteStorage>,
  queue: RetryQueue<SqliteQueue>,
  notifications: NotificationDispatcher,
  clients: Arc<ClientRegistry>,
  transport: Arc<dyn Transport>,
}

impl ServiceWorker {
  pub fn new(
    config: Config,
    db: Arc<Database>,
    transport: Arc<dyn Transport>,
    host: Arc<dyn Host>,
  ) -> Result<Self> {
    let storage = Arc::new(SqliteStorage::new(db.clone()));
    let layer = CacheLayer::new(
      storage,
      transport.clone(),
      config.partition(Purpose::Precache).to_string(),
      config.partition(Purpose::Runtime).to_string(),
      config.resolve(&config.offline_fallback)?,
    );

    let manifest = config
      .precache
      .iter()
      .map(|p| config.resolve(p))
      .collect::<Result<Vec<_>>>()?;

    let clients = Arc::new(ClientRegistry::new());

    Ok(Self {
      router: Router::new(&config),
      lifecycle: Lifecycle::new(layer.clone(), manifest, host.clone()),
      queue: RetryQueue::new(
        Arc::new(SqliteQueue::new(db)),
        transport.clone(),
        config.max_replay_attempts,
      ),
      notifications: NotificationDispatcher::new(
        host,
        clients.clone(),
        config.origin.clone(),
        config.notification.clone(),
      ),
      layer,
      clients,
      transport,
      config,
    })
  }

  pub fn state(&self) -> Result<LifecycleState> {
    self.lifecycle.state()
  }

  /// Resolve a path or URL against the application origin.
  pub fn resolve(&self, path: &str) -> Result<Url> {
    self.config.resolve(path)
  }

  /// Bring the worker up through the dispatcher: install (or restore an
  /// intact precache), then try to activate.
  pub async fn start(&self) -> Result<LifecycleState> {
    self.dispatch(WorkerEvent::Install).await?;
    self.dispatch(WorkerEvent::Activate).await?;
    self.lifecycle.state()
  }

  /// Route one event to the component that owns it.
  pub async fn dispatch(&self, event: WorkerEvent) -> Result<Outcome> {
    match event {
      WorkerEvent::Install => {
        if self.lifecycle.is_installed()? {
          info!(version = %self.config.version, "precache intact, skipping install");
          self.lifecycle.restore()?;
        } else {
          self.lifecycle.install().await?;
        }
        Ok(Outcome::Lifecycle(self.lifecycle.state()?))
      }
      WorkerEvent::Activate => {
        self.lifecycle.try_activate(self.clients.len()?)?;
        Ok(Outcome::Lifecycle(self.lifecycle.state()?))
      }
      WorkerEvent::Fetch(request) => Ok(Outcome::Fetch(self.handle_fetch(request).await?)),
      WorkerEvent::Message(message) => {
        let channel = ControlChannel {
          lifecycle: &self.lifecycle,
          layer: &self.layer,
          origin: &self.config.origin,
          open_clients: self.clients.len()?,
        };
        Ok(Outcome::Control(channel.handle(message).await?))
      }
      WorkerEvent::ClientOpened { id, url } => {
        self.clients.open(&id, url)?;
        Ok(Outcome::Done)
      }
      WorkerEvent::ClientNavigated { id, url } => {
        self.clients.navigate(&id, url)?;
        Ok(Outcome::Done)
      }
      WorkerEvent::ClientClosed { id } => {
        let remaining = self.clients.close(&id)?;
        if remaining == 0 && self.lifecycle.try_activate(0)? {
          debug!("last page closed, activated waiting worker");
        }
        Ok(Outcome::Done)
      }
      event if !self.lifecycle.is_active() => {
        warn!(?event, "worker not active, ignoring event");
        Ok(Outcome::Ignored)
      }
      WorkerEvent::Push(data) => Ok(Outcome::Notified(self.notifications.on_push(&data))),
      WorkerEvent::NotificationClick { id, data } => {
        Ok(Outcome::Click(self.notifications.on_click(&id, &data)?))
      }
      WorkerEvent::Sync { tag } | WorkerEvent::PeriodicSync { tag } => {
        Ok(Outcome::Replay(vec![self.queue.replay(&tag).await?]))
      }
      WorkerEvent::Online => Ok(Outcome::Replay(self.queue.replay_all().await?)),
    }
  }

  async fn handle_fetch(&self, request: Request) -> Result<FetchOutcome> {
    if !self.lifecycle.is_active() {
      debug!(url = %request.url, "not active, declining");
      return Ok(FetchOutcome::Decline);
    }

    let result = match self.router.classify(&request) {
      Route::PassThrough => return Ok(FetchOutcome::Decline),
      Route::CacheFirst => self.layer.cache_first(&request).await?,
      Route::NetworkFirst => self.layer.network_first(&request).await?,
      Route::Replayable { tag } => {
        // Malformed requests fail locally and are never queued
        validate_request(&request)?;
        self.send_or_enqueue(&tag, &request).await?
      }
    };

    Ok(FetchOutcome::Respond(result))
  }

  /// Send a mutating request; queue it once under `tag` if delivery fails.
  /// The failure is still returned to the page.
  async fn send_or_enqueue(&self, tag: &str, request: &Request) -> Result<CacheResult> {
    match self.transport.fetch(request).await {
      Ok(response) => Ok(CacheResult::from_network(response)),
      Err(e) => {
        if let Err(queue_err) = self.queue.enqueue(tag, request) {
          error!(tag, url = %request.url, error = %queue_err, "failed to queue request");
        }
        Err(e)
      }
    }
  }

  /// Tags the periodic timer should replay: configured plus any with items.
  pub fn replay_tags(&self) -> Result<Vec<String>> {
    let mut tags = self.config.sync_tags();
    for tag in self.queue.storage().tags()? {
      if !tags.contains(&tag) {
        tags.push(tag);
      }
    }
    Ok(tags)
  }

  pub fn status(&self) -> Result<Status> {
    let storage = self.layer.storage();
    let partitions = storage
      .partitions()?
      .into_iter()
      .map(|name| {
        let entries = storage.entry_count(&name)?;
        Ok(PartitionStatus { name, entries })
      })
      .collect::<Result<Vec<_>>>()?;

    let queue = self.queue.storage();
    let queues = self
      .replay_tags()?
      .into_iter()
      .map(|tag| {
        let pending = queue.len(&tag)?;
        Ok(QueueStatus { tag, pending })
      })
      .collect::<Result<Vec<_>>>()?;

    Ok(Status {
      version: self.config.version.clone(),
      state: self.lifecycle.state()?,
      installed: self.lifecycle.is_installed()?,
      partitions,
      queues,
    })
  }
}

struct Envelope {
  event: WorkerEvent,
  reply: Option<oneshot::Sender<Result<Outcome>>>,
}

/// Cloneable sender into the worker's event queue.
#[derive(Clone)]
pub struct WorkerHandle {
  tx: mpsc::UnboundedSender<Envelope>,
}

impl WorkerHandle {
  /// Queue an event without waiting for its outcome.
  pub fn send(&self, event: WorkerEvent) -> Result<()> {
    self
      .tx
      .send(Envelope { event, reply: None })
      .map_err(|_| eyre!("Worker has shut down"))
  }

  /// Queue an event and wait for its outcome.
  pub async fn request(&self, event: WorkerEvent) -> Result<Outcome> {
    let (reply, rx) = oneshot::channel();
    self
      .tx
      .send(Envelope {
        event,
        reply: Some(reply),
      })
      .map_err(|_| eyre!("Worker has shut down"))?;
    rx.await.map_err(|_| eyre!("Worker dropped the event"))?
  }
}

/// Start the event loop. It runs until every handle is dropped, then waits
/// for in-flight events to settle.
pub fn spawn(worker: Arc<ServiceWorker>) -> (WorkerHandle, tokio::task::JoinHandle<()>) {
  let (tx, rx) = mpsc::unbounded_channel();
  let task = tokio::spawn(run(worker, rx));
  (WorkerHandle { tx }, task)
}

async fn run(worker: Arc<ServiceWorker>, mut rx: mpsc::UnboundedReceiver<Envelope>) {
  let mut in_flight = JoinSet::new();
  let mut ticker = tokio::time::interval(worker.config.periodic_sync_interval());
  // The first tick completes immediately; replay waits a full period
  ticker.tick().await;

  loop {
    tokio::select! {
      envelope = rx.recv() => {
        let Some(Envelope { event, reply }) = envelope else {
          break;
        };

        if event.is_ordered() {
          let outcome = worker.dispatch(event).await;
          respond(reply, outcome);
        } else {
          let worker = Arc::clone(&worker);
          in_flight.spawn(async move {
            let outcome = worker.dispatch(event).await;
            respond(reply, outcome);
          });
        }
      }
      _ = ticker.tick() => {
        let tags = match worker.replay_tags() {
          Ok(tags) => tags,
          Err(e) => {
            warn!(error = %e, "failed to list sync tags");
            continue;
          }
        };
        for tag in tags {
          let worker = Arc::clone(&worker);
          in_flight.spawn(async move {
            let outcome = worker.dispatch(WorkerEvent::PeriodicSync { tag }).await;
            respond(None, outcome);
          });
        }
      }
      Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
    }
  }

  while in_flight.join_next().await.is_some() {}
  debug!("worker event loop stopped");
}

fn respond(reply: Option<oneshot::Sender<Result<Outcome>>>, outcome: Result<Outcome>) {
  match reply {
    Some(reply) => {
      // Ignore send errors - the caller stopped waiting
      let _ = reply.send(outcome);
    }
    None => {
      if let Err(e) = outcome {
        warn!(error = %e, "event failed");
      }
    }
  }
}
