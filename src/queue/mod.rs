//! Persistent queue of failed mutating requests, replayed on reconnect or on a timer.

mod manager;
mod storage;

pub use manager::{ReplayReport, RetryQueue};
pub use storage::{QueueStorage, SqliteQueue};
