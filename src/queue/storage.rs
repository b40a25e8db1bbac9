//! Persistent retry queue storage.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension, Row};
use std::sync::Arc;

use crate::db::Database;
use crate::net::Request;

/// A mutating request waiting to be replayed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueItem {
  pub id: i64,
  pub tag: String,
  pub request: Request,
  /// Failed replay attempts so far
  pub attempts: u32,
  pub enqueued_at: DateTime<Utc>,
}

/// Trait for retry queue backends, keyed by sync tag.
pub trait QueueStorage: Send + Sync {
  /// Append a request to the end of the queue for `tag`.
  fn push(&self, tag: &str, request: &Request) -> Result<QueueItem>;

  /// Items queued under `tag`, in insertion order.
  fn items(&self, tag: &str) -> Result<Vec<QueueItem>>;

  fn get(&self, id: i64) -> Result<Option<QueueItem>>;

  /// Remove an item. Returns whether it was still queued.
  fn remove(&self, id: i64) -> Result<bool>;

  /// Increment the attempt count, returning the new value (None if gone).
  fn record_attempt(&self, id: i64) -> Result<Option<u32>>;

  /// Tags with at least one queued item.
  fn tags(&self) -> Result<Vec<String>>;

  fn len(&self, tag: &str) -> Result<usize>;
}

/// SQLite-backed retry queue.
pub struct SqliteQueue {
  db: Arc<Database>,
}

impl SqliteQueue {
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }
}

type RawItem = (i64, String, String, u32, String);

fn raw_item(row: &Row<'_>) -> rusqlite::Result<RawItem> {
  Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn decode((id, tag, request, attempts, enqueued_at): RawItem) -> Result<QueueItem> {
  let request: Request = serde_json::from_str(&request)
    .map_err(|e| eyre!("Failed to deserialize queued request {}: {}", id, e))?;
  let enqueued_at = DateTime::parse_from_rfc3339(&enqueued_at)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", enqueued_at, e))?;

  Ok(QueueItem {
    id,
    tag,
    request,
    attempts,
    enqueued_at,
  })
}

impl QueueStorage for SqliteQueue {
  fn push(&self, tag: &str, request: &Request) -> Result<QueueItem> {
    let conn = self.db.conn()?;
    let data =
      serde_json::to_string(request).map_err(|e| eyre!("Failed to serialize request: {}", e))?;
    let enqueued_at = Utc::now();

    conn
      .execute(
        "INSERT INTO retry_queue (tag, request, attempts, enqueued_at) VALUES (?, ?, 0, ?)",
        params![tag, data, enqueued_at.to_rfc3339()],
      )
      .map_err(|e| eyre!("Failed to enqueue request: {}", e))?;

    Ok(QueueItem {
      id: conn.last_insert_rowid(),
      tag: tag.to_string(),
      request: request.clone(),
      attempts: 0,
      enqueued_at,
    })
  }

  fn items(&self, tag: &str) -> Result<Vec<QueueItem>> {
    let conn = self.db.conn()?;
    let mut stmt = conn
      .prepare(
        "SELECT id, tag, request, attempts, enqueued_at FROM retry_queue
         WHERE tag = ? ORDER BY id",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map(params![tag], raw_item)
      .map_err(|e| eyre!("Failed to query retry queue: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read retry queue: {}", e))?;

    rows.into_iter().map(decode).collect()
  }

  fn get(&self, id: i64) -> Result<Option<QueueItem>> {
    let conn = self.db.conn()?;
    let row = conn
      .query_row(
        "SELECT id, tag, request, attempts, enqueued_at FROM retry_queue WHERE id = ?",
        params![id],
        raw_item,
      )
      .optional()
      .map_err(|e| eyre!("Failed to query retry queue: {}", e))?;

    row.map(decode).transpose()
  }

  fn remove(&self, id: i64) -> Result<bool> {
    let conn = self.db.conn()?;
    let removed = conn
      .execute("DELETE FROM retry_queue WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to remove queued request {}: {}", id, e))?;
    Ok(removed > 0)
  }

  fn record_attempt(&self, id: i64) -> Result<Option<u32>> {
    let conn = self.db.conn()?;
    conn
      .query_row(
        "UPDATE retry_queue SET attempts = attempts + 1 WHERE id = ? RETURNING attempts",
        params![id],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to record attempt for {}: {}", id, e))
  }

  fn tags(&self) -> Result<Vec<String>> {
    let conn = self.db.conn()?;
    let mut stmt = conn
      .prepare("SELECT tag FROM retry_queue GROUP BY tag ORDER BY MIN(id)")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let tags = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list queue tags: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read queue tag: {}", e))?;
    Ok(tags)
  }

  fn len(&self, tag: &str) -> Result<usize> {
    let conn = self.db.conn()?;
    let count: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM retry_queue WHERE tag = ?",
        params![tag],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count queue: {}", e))?;
    Ok(count as usize)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::testing::url;

  fn queue() -> SqliteQueue {
    SqliteQueue::new(Arc::new(Database::open_in_memory().unwrap()))
  }

  #[test]
  fn test_push_preserves_request_and_order() {
    let queue = queue();
    let first = Request::new("POST", url("/api/bugs"))
      .with_header("Content-Type", "application/json")
      .with_body(r#"{"title":"crash"}"#);
    let second = Request::new("DELETE", url("/api/bugs/7"));

    queue.push("sync-bugs", &first).unwrap();
    queue.push("sync-scans", &Request::new("POST", url("/api/scans"))).unwrap();
    queue.push("sync-bugs", &second).unwrap();

    let items = queue.items("sync-bugs").unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(items[0].request, first);
    assert_eq!(items[1].request, second);
    assert!(items[0].id < items[1].id);
    assert_eq!(items[0].attempts, 0);

    assert_eq!(queue.tags().unwrap(), vec!["sync-bugs", "sync-scans"]);
    assert_eq!(queue.len("sync-scans").unwrap(), 1);
  }

  #[test]
  fn test_record_attempt_and_remove() {
    let queue = queue();
    let item = queue.push("sync-bugs", &Request::new("POST", url("/api/bugs"))).unwrap();

    assert_eq!(queue.record_attempt(item.id).unwrap(), Some(1));
    assert_eq!(queue.record_attempt(item.id).unwrap(), Some(2));
    assert_eq!(queue.get(item.id).unwrap().unwrap().attempts, 2);

    assert!(queue.remove(item.id).unwrap());
    assert!(!queue.remove(item.id).unwrap());
    assert_eq!(queue.record_attempt(item.id).unwrap(), None);
    assert!(queue.get(item.id).unwrap().is_none());
    assert!(queue.tags().unwrap().is_empty());
  }

  #[test]
  fn test_queue_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("worker.db");

    {
      let queue = SqliteQueue::new(Arc::new(Database::open(Some(&path)).unwrap()));
      queue.push("sync-scans", &Request::new("POST", url("/api/scans"))).unwrap();
    }

    let queue = SqliteQueue::new(Arc::new(Database::open(Some(&path)).unwrap()));
    assert_eq!(queue.len("sync-scans").unwrap(), 1);
  }

  #[test]
  fn test_binary_body_is_stored_exactly() {
    let queue = queue();
    let upload = Request::new("POST", url("/api/scans")).with_body(vec![137, 80, 78, 71, 255, 0]);
    let item = queue.push("sync-scans", &upload).unwrap();

    let stored = queue.get(item.id).unwrap().unwrap();
    assert_eq!(stored.request.body, vec![137, 80, 78, 71, 255, 0]);
    assert_eq!(stored.request, upload);
  }
}
