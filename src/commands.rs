//! Command correlation table.
//!
//! Every dispatched command gets an identifier; the agent echoes it back with
//! the result. Waiters block on a notifier, not on polling. The table lock is
//! a leaf: nothing else is locked while holding it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::{C2Error, Result};

/// Default wait for a command result
pub const DEFAULT_WAIT: Duration = Duration::from_secs(10);

/// Entries older than this are swept regardless of state
const MAX_AGE: Duration = Duration::from_secs(3600);

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

struct CommandEntry {
    command: String,
    dispatched_at: Instant,
    dispatched: DateTime<Utc>,
    result: Option<String>,
}

#[derive(Default)]
pub struct CommandTable {
    entries: Mutex<HashMap<String, CommandEntry>>,
    notify: Notify,
}

impl CommandTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a freshly allocated identifier and return it
    pub fn allocate(&self, command: &str) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        self.track(&id, command);
        id
    }

    /// Record the dispatch of a caller-supplied identifier
    pub fn track(&self, id: &str, command: &str) {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(
            id.to_string(),
            CommandEntry {
                command: command.to_string(),
                dispatched_at: Instant::now(),
                dispatched: Utc::now(),
                result: None,
            },
        );
    }

    /// Store a result and wake waiters. Returns time since dispatch when the
    /// identifier was tracked; unsolicited results are kept anyway.
    pub fn complete(&self, id: &str, text: &str) -> Option<Duration> {
        let elapsed = {
            let mut entries = self.entries.lock().unwrap();
            match entries.get_mut(id) {
                Some(entry) => {
                    entry.result = Some(text.to_string());
                    Some(entry.dispatched_at.elapsed())
                }
                None => {
                    entries.insert(
                        id.to_string(),
                        CommandEntry {
                            command: String::new(),
                            dispatched_at: Instant::now(),
                            dispatched: Utc::now(),
                            result: Some(text.to_string()),
                        },
                    );
                    None
                }
            }
        };
        self.notify.notify_waiters();
        elapsed
    }

    /// Result text if it has arrived. Does not remove the entry.
    pub fn peek(&self, id: &str) -> Option<String> {
        let entries = self.entries.lock().unwrap();
        entries.get(id).and_then(|e| e.result.clone())
    }

    pub fn command_of(&self, id: &str) -> Option<String> {
        let entries = self.entries.lock().unwrap();
        entries.get(id).map(|e| e.command.clone())
    }

    pub fn dispatched(&self, id: &str) -> Option<DateTime<Utc>> {
        let entries = self.entries.lock().unwrap();
        entries.get(id).map(|e| e.dispatched)
    }

    /// Remove an entry. Every allocator must discard once done.
    pub fn discard(&self, id: &str) {
        self.entries.lock().unwrap().remove(id);
    }

    /// Block until the result for `id` arrives or the deadline passes.
    pub async fn await_result(&self, id: &str, deadline: Duration) -> Result<String> {
        let deadline = tokio::time::Instant::now() + deadline;
        loop {
            // register before checking so a concurrent complete() cannot slip
            // between the check and the wait
            let notified = self.notify.notified();
            if let Some(text) = self.peek(id) {
                return Ok(text);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(C2Error::CommandTimeout(id.to_string()));
            }
        }
    }

    fn sweep(&self) -> usize {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|_, e| e.dispatched_at.elapsed() < MAX_AGE);
        before - entries.len()
    }

    /// Background sweeper deleting entries older than an hour
    pub fn spawn_sweeper(self: &Arc<Self>, cancel: CancellationToken) {
        let table = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let swept = table.sweep();
                        if swept > 0 {
                            tracing::debug!("command table: swept {swept} stale entries");
                        }
                    }
                    _ = cancel.cancelled() => return,
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn complete_wakes_waiter() {
        let table = Arc::new(CommandTable::new());
        let id = table.allocate("echo hi");

        let waiter = {
            let table = table.clone();
            let id = id.clone();
            tokio::spawn(async move { table.await_result(&id, DEFAULT_WAIT).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        table.complete(&id, "hi");

        assert_eq!(waiter.await.unwrap().unwrap(), "hi");
        table.discard(&id);
        assert!(table.peek(&id).is_none());
    }

    #[tokio::test]
    async fn result_before_wait_is_seen() {
        let table = CommandTable::new();
        let id = table.allocate("whoami");
        table.complete(&id, "root");
        assert_eq!(table.await_result(&id, DEFAULT_WAIT).await.unwrap(), "root");
    }

    #[tokio::test(start_paused = true)]
    async fn await_times_out() {
        let table = CommandTable::new();
        let id = table.allocate("sleep 3600");
        let err = table
            .await_result(&id, Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(matches!(err, C2Error::CommandTimeout(_)));
    }

    #[tokio::test]
    async fn concurrent_results_keep_their_ids() {
        let table = Arc::new(CommandTable::new());
        let id_a = table.allocate("cmd a");
        let id_b = table.allocate("cmd b");

        let wait_a = {
            let (t, id) = (table.clone(), id_a.clone());
            tokio::spawn(async move { t.await_result(&id, DEFAULT_WAIT).await })
        };
        let wait_b = {
            let (t, id) = (table.clone(), id_b.clone());
            tokio::spawn(async move { t.await_result(&id, DEFAULT_WAIT).await })
        };

        table.complete(&id_b, "out b");
        table.complete(&id_a, "out a");

        assert_eq!(wait_a.await.unwrap().unwrap(), "out a");
        assert_eq!(wait_b.await.unwrap().unwrap(), "out b");
    }

    #[test]
    fn unsolicited_result_is_kept() {
        let table = CommandTable::new();
        assert!(table.complete("stray-id", "late output").is_none());
        assert_eq!(table.peek("stray-id").unwrap(), "late output");
    }

    #[test]
    fn sweep_only_removes_old_entries() {
        let table = CommandTable::new();
        table.allocate("fresh");
        assert_eq!(table.sweep(), 0);
    }
}
