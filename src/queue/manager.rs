use color_eyre::{eyre::eyre, Result};
use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

use super::storage::{QueueItem, QueueStorage};
use crate::net::{Request, Transport};

/// Outcome of one replay pass over a tag.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayReport {
  pub tag: String,
  /// Delivered with a 2xx and removed
  pub replayed: usize,
  /// Still queued, attempt count incremented
  pub failed: usize,
  /// Removed after reaching the attempt limit
  pub dropped: usize,
  /// Trigger arrived while this tag was already replaying; the running pass
  /// rescans the queue on its behalf
  pub coalesced: bool,
}

/// Replays failed mutating requests, per sync tag.
///
/// Replay goes straight to the transport: no routing, no caching.
pub struct RetryQueue<Q: QueueStorage> {
  storage: Arc<Q>,
  transport: Arc<dyn Transport>,
  max_attempts: u32,
  /// Tags currently replaying, mapped to whether another trigger arrived meanwhile
  in_flight: Mutex<HashMap<String, bool>>,
}

/// Marks a tag as replaying until released or dropped.
struct InFlight<'a> {
  map: &'a Mutex<HashMap<String, bool>>,
  tag: String,
  released: bool,
}

impl InFlight<'_> {
  /// Either consume a pending rerun request or release the tag.
  ///
  /// Both happen under one lock, so a trigger is never lost between the
  /// check and the release.
  fn rerun_requested(&mut self) -> Result<bool> {
    let mut map = self.map.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;
    if map.get(&self.tag).copied().unwrap_or(false) {
      map.insert(self.tag.clone(), false);
      return Ok(true);
    }
    map.remove(&self.tag);
    self.released = true;
    Ok(false)
  }
}

impl Drop for InFlight<'_> {
  fn drop(&mut self) {
    if self.released {
      return;
    }
    if let Ok(mut map) = self.map.lock() {
      map.remove(&self.tag);
    }
  }
}

impl<Q: QueueStorage> RetryQueue<Q> {
  pub fn new(storage: Arc<Q>, transport: Arc<dyn Transport>, max_attempts: u32) -> Self {
    Self {
      storage,
      transport,
      max_attempts: max_attempts.max(1),
      in_flight: Mutex::new(HashMap::new()),
    }
  }

  pub fn storage(&self) -> &Arc<Q> {
    &self.storage
  }

  /// Persist a request whose delivery failed.
  pub fn enqueue(&self, tag: &str, request: &Request) -> Result<QueueItem> {
    let item = self.storage.push(tag, request)?;
    info!(tag, id = item.id, method = %request.method, url = %request.url, "queued for replay");
    Ok(item)
  }

  /// Claim `tag` for a replay pass, or flag the running pass to look again.
  fn begin(&self, tag: &str) -> Result<Option<InFlight<'_>>> {
    let mut map = self
      .in_flight
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    if let Some(rerun) = map.get_mut(tag) {
      *rerun = true;
      return Ok(None);
    }
    map.insert(tag.to_string(), false);
    Ok(Some(InFlight {
      map: &self.in_flight,
      tag: tag.to_string(),
      released: false,
    }))
  }

  /// Replay every item queued under `tag`, in insertion order.
  ///
  /// Items are removed only after a 2xx. The queue is re-read per item since
  /// other handlers may remove or append while this pass runs. A trigger that
  /// arrives mid-pass makes the running pass pick up items queued since it
  /// started; each item is still tried at most once per pass.
  pub async fn replay(&self, tag: &str) -> Result<ReplayReport> {
    let mut report = ReplayReport {
      tag: tag.to_string(),
      ..Default::default()
    };

    let Some(mut guard) = self.begin(tag)? else {
      debug!(tag, "replay already in progress, handing trigger to running pass");
      report.coalesced = true;
      return Ok(report);
    };

    let mut seen = HashSet::new();
    loop {
      let ids: Vec<i64> = self
        .storage
        .items(tag)?
        .iter()
        .map(|item| item.id)
        .filter(|id| seen.insert(*id))
        .collect();

      for id in ids {
        self.replay_item(tag, id, &mut report).await?;
      }

      if !guard.rerun_requested()? {
        break;
      }
      debug!(tag, "trigger arrived during replay, rescanning queue");
    }

    if report.replayed + report.failed + report.dropped > 0 {
      info!(
        tag,
        replayed = report.replayed,
        failed = report.failed,
        dropped = report.dropped,
        "replay finished"
      );
    }
    Ok(report)
  }

  async fn replay_item(&self, tag: &str, id: i64, report: &mut ReplayReport) -> Result<()> {
    let Some(item) = self.storage.get(id)? else {
      return Ok(());
    };

    let delivered = match self.transport.fetch(&item.request).await {
      Ok(response) if response.is_success() => true,
      Ok(response) => {
        warn!(tag, id, status = response.status, "replay rejected by server");
        false
      }
      Err(e) => {
        debug!(tag, id, error = %e, "replay delivery failed");
        false
      }
    };

    if delivered {
      self.storage.remove(id)?;
      report.replayed += 1;
      return Ok(());
    }

    match self.storage.record_attempt(id)? {
      Some(attempts) if attempts >= self.max_attempts => {
        self.storage.remove(id)?;
        error!(
          tag,
          id,
          attempts,
          method = %item.request.method,
          url = %item.request.url,
          "dropping queued request after max attempts"
        );
        report.dropped += 1;
      }
      Some(_) => report.failed += 1,
      None => {}
    }
    Ok(())
  }

  /// Replay every tag that has queued items, tags concurrently.
  pub async fn replay_all(&self) -> Result<Vec<ReplayReport>> {
    let tags = self.storage.tags()?;
    join_all(tags.iter().map(|tag| self.replay(tag)))
      .await
      .into_iter()
      .collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::db::Database;
  use crate::net::Response;
  use crate::queue::SqliteQueue;
  use crate::testing::{url, MockTransport};

  fn retry_queue(transport: Arc<MockTransport>, max_attempts: u32) -> RetryQueue<SqliteQueue> {
    let storage = Arc::new(SqliteQueue::new(Arc::new(Database::open_in_memory().unwrap())));
    RetryQueue::new(storage, transport, max_attempts)
  }

  #[tokio::test]
  async fn test_successful_replay_empties_tag() {
    let transport = Arc::new(MockTransport::new());
    transport.respond("/api/bugs", Response::new(201, "created"));
    let queue = retry_queue(transport.clone(), 5);

    queue
      .enqueue("sync-bugs", &Request::new("POST", url("/api/bugs")))
      .unwrap();

    let report = queue.replay("sync-bugs").await.unwrap();
    assert_eq!(report.replayed, 1);
    assert_eq!(queue.storage().len("sync-bugs").unwrap(), 0);
    assert_eq!(transport.calls("/api/bugs"), 1);
  }

  #[tokio::test]
  async fn test_failed_replay_increments_attempts_once() {
    let transport = Arc::new(MockTransport::new());
    transport.set_online(false);
    let queue = retry_queue(transport.clone(), 5);
    let item = queue
      .enqueue("sync-bugs", &Request::new("POST", url("/api/bugs")))
      .unwrap();

    let report = queue.replay("sync-bugs").await.unwrap();
    assert_eq!(report.failed, 1);

    let items = queue.storage().items("sync-bugs").unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].id, item.id);
    assert_eq!(items[0].attempts, 1);
  }

  #[tokio::test]
  async fn test_server_error_keeps_item() {
    let transport = Arc::new(MockTransport::new());
    transport.respond("/api/scans", Response::new(503, "busy"));
    let queue = retry_queue(transport, 5);
    queue
      .enqueue("sync-scans", &Request::new("POST", url("/api/scans")))
      .unwrap();

    queue.replay("sync-scans").await.unwrap();
    assert_eq!(queue.storage().items("sync-scans").unwrap()[0].attempts, 1);
  }

  #[tokio::test]
  async fn test_n_items_replayed_exactly_once() {
    let transport = Arc::new(MockTransport::new());
    transport.respond("/api/bugs", Response::new(200, "ok"));
    transport.set_online(false);
    let queue = retry_queue(transport.clone(), 10);

    for i in 0..5 {
      queue
        .enqueue(
          "sync-bugs",
          &Request::new("POST", url("/api/bugs")).with_body(format!("{{\"n\":{}}}", i)),
        )
        .unwrap();
    }

    // Offline trigger: nothing delivered
    queue.replay("sync-bugs").await.unwrap();
    assert_eq!(transport.successes("/api/bugs"), 0);

    transport.set_online(true);
    let first = queue.replay("sync-bugs").await.unwrap();
    let second = queue.replay("sync-bugs").await.unwrap();

    assert_eq!(first.replayed, 5);
    assert_eq!(second.replayed, 0);
    assert_eq!(transport.successes("/api/bugs"), 5);
    assert_eq!(queue.storage().len("sync-bugs").unwrap(), 0);
  }

  #[tokio::test]
  async fn test_replay_preserves_insertion_order() {
    let transport = Arc::new(MockTransport::new());
    transport.respond("/api/bugs/1", Response::new(200, ""));
    transport.respond("/api/bugs/2", Response::new(200, ""));
    transport.respond("/api/bugs/3", Response::new(200, ""));
    let queue = retry_queue(transport.clone(), 10);

    for path in ["/api/bugs/2", "/api/bugs/1", "/api/bugs/3"] {
      queue
        .enqueue("sync-bugs", &Request::new("PUT", url(path)))
        .unwrap();
    }
    queue.replay("sync-bugs").await.unwrap();

    assert_eq!(
      transport.history(),
      vec!["PUT /api/bugs/2", "PUT /api/bugs/1", "PUT /api/bugs/3"]
    );
  }

  #[tokio::test]
  async fn test_max_attempts_drops_item() {
    let transport = Arc::new(MockTransport::new());
    transport.set_online(false);
    let queue = retry_queue(transport, 2);
    queue
      .enqueue("sync-bugs", &Request::new("POST", url("/api/bugs")))
      .unwrap();

    assert_eq!(queue.replay("sync-bugs").await.unwrap().failed, 1);
    assert_eq!(queue.replay("sync-bugs").await.unwrap().dropped, 1);
    assert_eq!(queue.storage().len("sync-bugs").unwrap(), 0);
  }

  #[tokio::test]
  async fn test_replay_all_covers_every_tag() {
    let transport = Arc::new(MockTransport::new());
    transport.respond("/api/bugs", Response::new(200, ""));
    transport.respond("/api/scans", Response::new(200, ""));
    let queue = retry_queue(transport, 10);
    queue
      .enqueue("sync-bugs", &Request::new("POST", url("/api/bugs")))
      .unwrap();
    queue
      .enqueue("sync-scans", &Request::new("POST", url("/api/scans")))
      .unwrap();

    let reports = queue.replay_all().await.unwrap();
    assert_eq!(reports.len(), 2);
    assert!(reports.iter().all(|r| r.replayed == 1));
    assert!(queue.storage().tags().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_concurrent_trigger_is_coalesced() {
    let transport = Arc::new(MockTransport::new());
    transport.respond("/api/bugs", Response::new(200, ""));
    transport.set_delay(std::time::Duration::from_millis(50));
    let queue = Arc::new(retry_queue(transport.clone(), 10));
    queue
      .enqueue("sync-bugs", &Request::new("POST", url("/api/bugs")))
      .unwrap();

    let (a, b) = tokio::join!(queue.replay("sync-bugs"), queue.replay("sync-bugs"));
    let (a, b) = (a.unwrap(), b.unwrap());

    assert!(a.coalesced != b.coalesced);
    assert_eq!(a.replayed + b.replayed, 1);
    assert_eq!(transport.successes("/api/bugs"), 1);
  }

  #[tokio::test]
  async fn test_trigger_during_replay_picks_up_new_items() {
    let transport = Arc::new(MockTransport::new());
    transport.respond("/api/bugs/1", Response::new(200, ""));
    transport.respond("/api/bugs/2", Response::new(200, ""));
    transport.set_delay(std::time::Duration::from_millis(50));
    let queue = Arc::new(retry_queue(transport.clone(), 10));
    queue
      .enqueue("sync-bugs", &Request::new("PUT", url("/api/bugs/1")))
      .unwrap();

    let late = async {
      tokio::time::sleep(std::time::Duration::from_millis(10)).await;
      queue
        .enqueue("sync-bugs", &Request::new("PUT", url("/api/bugs/2")))
        .unwrap();
      queue.replay("sync-bugs").await
    };
    let (a, b) = tokio::join!(queue.replay("sync-bugs"), late);
    let (a, b) = (a.unwrap(), b.unwrap());

    assert!(b.coalesced);
    assert_eq!(a.replayed, 2);
    assert_eq!(queue.storage().len("sync-bugs").unwrap(), 0);
    assert_eq!(
      transport.history(),
      vec!["PUT /api/bugs/1", "PUT /api/bugs/2"]
    );
  }

  #[tokio::test]
  async fn test_rescan_does_not_retry_failed_items_twice() {
    let transport = Arc::new(MockTransport::new());
    transport.respond("/api/bugs/1", Response::new(503, ""));
    transport.respond("/api/bugs/2", Response::new(200, ""));
    transport.set_delay(std::time::Duration::from_millis(50));
    let queue = Arc::new(retry_queue(transport.clone(), 10));
    queue
      .enqueue("sync-bugs", &Request::new("PUT", url("/api/bugs/1")))
      .unwrap();

    let late = async {
      tokio::time::sleep(std::time::Duration::from_millis(10)).await;
      queue
        .enqueue("sync-bugs", &Request::new("PUT", url("/api/bugs/2")))
        .unwrap();
      queue.replay("sync-bugs").await
    };
    let (a, _) = tokio::join!(queue.replay("sync-bugs"), late);
    let a = a.unwrap();

    assert_eq!((a.replayed, a.failed), (1, 1));
    let items = queue.storage().items("sync-bugs").unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].attempts, 1);
  }
}
