//! Process-wide agent registry.
//!
//! One control record per agent tag, guarded by a single reader-writer lock.
//! Index assignment happens under the write lock; sends to an agent clone the
//! tunnel sender under the read lock and write after dropping it, so the lock
//! is never held across I/O.
//!
//! An agent record is created at check-in (no connection yet); the message
//! tunnel attaches the connection when its first envelope arrives. When the
//! tunnel closes the record lingers for a grace period before removal, so a
//! reconnecting agent keeps its index and label.

use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::Agent;
use crate::{C2Error, Result};

/// How long a disconnected agent record survives before removal
pub const AGENT_GRACE: Duration = Duration::from_secs(60);

/// Controller interface of one connected agent
struct ControlRecord {
    index: usize,
    label: String,
    /// Serialized envelopes handed to the tunnel write loop. None while the
    /// agent has no live connection.
    sender: Option<mpsc::Sender<Bytes>>,
    /// Tears down the tunnel and every child task (port forwards, transfers)
    cancel: CancellationToken,
    /// Identifies the HTTP/2 connection carrying the tunnel
    conn_id: u64,
}

struct Entry {
    agent: Agent,
    control: ControlRecord,
}

/// Snapshot of an agent plus its control metadata
#[derive(Debug, Clone)]
pub struct AgentListing {
    pub agent: Agent,
    pub index: usize,
    pub label: String,
    pub connected: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabeledAgent {
    pub tag: String,
    pub label: String,
}

#[derive(Default)]
struct Inner {
    map: HashMap<String, Entry>,
    next_index: usize,
}

#[derive(Default)]
pub struct AgentRegistry {
    inner: RwLock<Inner>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a check-in. An existing tag keeps its index, label, and
    /// control context and has its metadata replaced. Returns the assigned
    /// index and whether the tag is new.
    pub fn register(&self, agent: Agent) -> (usize, bool) {
        let mut inner = self.inner.write().unwrap();
        let tag = agent.tag.clone();

        if let Some(entry) = inner.map.get_mut(&tag) {
            entry.agent = agent;
            return (entry.control.index, false);
        }

        inner.next_index += 1;
        let index = inner.next_index;
        inner.map.insert(
            tag,
            Entry {
                agent,
                control: ControlRecord {
                    index,
                    label: String::new(),
                    sender: None,
                    cancel: CancellationToken::new(),
                    conn_id: 0,
                },
            },
        );
        (index, true)
    }

    /// Bind a live tunnel connection to an agent. A previous connection, if
    /// any, has its context cancelled; the returned token owns every task
    /// spawned for this agent.
    pub fn attach_conn(
        &self,
        tag: &str,
        sender: mpsc::Sender<Bytes>,
        conn_id: u64,
    ) -> Result<CancellationToken> {
        let mut inner = self.inner.write().unwrap();
        let entry = inner
            .map
            .get_mut(tag)
            .ok_or_else(|| C2Error::AgentUnknown(tag.to_string()))?;

        entry.control.cancel.cancel();
        let cancel = CancellationToken::new();
        entry.control.sender = Some(sender);
        entry.control.cancel = cancel.clone();
        entry.control.conn_id = conn_id;
        Ok(cancel)
    }

    /// Drop the connection of an agent if `conn_id` still owns it. Cancels
    /// the control context; the record itself stays for the grace period.
    pub fn detach_conn(&self, tag: &str, conn_id: u64) {
        let mut inner = self.inner.write().unwrap();
        if let Some(entry) = inner.map.get_mut(tag) {
            if entry.control.conn_id == conn_id {
                entry.control.cancel.cancel();
                entry.control.sender = None;
            }
        }
    }

    /// Remove an agent whose grace period expired without a reconnect.
    /// Idempotent; a record that re-attached in the meantime is left alone.
    pub fn remove_if_disconnected(&self, tag: &str) -> bool {
        let mut inner = self.inner.write().unwrap();
        let disconnected = inner
            .map
            .get(tag)
            .map(|e| e.control.sender.is_none())
            .unwrap_or(false);
        if disconnected {
            inner.map.remove(tag);
        }
        disconnected
    }

    /// Cancel the control context and drop the entry immediately. Idempotent.
    pub fn unregister(&self, tag: &str) {
        let mut inner = self.inner.write().unwrap();
        if let Some(entry) = inner.map.remove(tag) {
            entry.control.cancel.cancel();
        }
    }

    pub fn get_by_tag(&self, tag: &str) -> Option<Agent> {
        let inner = self.inner.read().unwrap();
        inner.map.get(tag).map(|e| e.agent.clone())
    }

    pub fn get_by_index(&self, index: usize) -> Option<Agent> {
        let inner = self.inner.read().unwrap();
        inner
            .map
            .values()
            .find(|e| e.control.index == index)
            .map(|e| e.agent.clone())
    }

    pub fn get_by_conn(&self, conn_id: u64) -> Option<Agent> {
        let inner = self.inner.read().unwrap();
        inner
            .map
            .values()
            .find(|e| e.control.conn_id == conn_id && e.control.sender.is_some())
            .map(|e| e.agent.clone())
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.inner.read().unwrap().map.contains_key(tag)
    }

    pub fn is_connected(&self, tag: &str) -> bool {
        let inner = self.inner.read().unwrap();
        inner
            .map
            .get(tag)
            .map(|e| e.control.sender.is_some())
            .unwrap_or(false)
    }

    pub fn list_connected(&self) -> Vec<AgentListing> {
        let inner = self.inner.read().unwrap();
        let mut listings: Vec<AgentListing> = inner
            .map
            .values()
            .map(|e| AgentListing {
                agent: e.agent.clone(),
                index: e.control.index,
                label: e.control.label.clone(),
                connected: e.control.sender.is_some(),
            })
            .collect();
        listings.sort_by_key(|l| l.index);
        listings
    }

    pub fn tags(&self) -> Vec<String> {
        let inner = self.inner.read().unwrap();
        inner.map.keys().cloned().collect()
    }

    /// The cancellation token owned by an agent's control record. Child
    /// tasks (port forwards, file transfers) tie their lifetime to it.
    pub fn control_token(&self, tag: &str) -> Option<CancellationToken> {
        let inner = self.inner.read().unwrap();
        inner.map.get(tag).map(|e| e.control.cancel.clone())
    }

    pub fn index_of(&self, tag: &str) -> Option<usize> {
        let inner = self.inner.read().unwrap();
        inner.map.get(tag).map(|e| e.control.index)
    }

    pub fn set_label(&self, tag: &str, label: &str) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        match inner.map.get_mut(tag) {
            Some(entry) => {
                entry.control.label = label.to_string();
                Ok(())
            }
            None => Err(C2Error::AgentUnknown(tag.to_string())),
        }
    }

    /// Queue a serialized envelope for an agent's tunnel write loop.
    pub async fn send(&self, tag: &str, frame: Bytes) -> Result<()> {
        let sender = {
            let inner = self.inner.read().unwrap();
            let entry = inner
                .map
                .get(tag)
                .ok_or_else(|| C2Error::AgentUnknown(tag.to_string()))?;
            entry
                .control
                .sender
                .clone()
                .ok_or_else(|| C2Error::AgentNotConnected(tag.to_string()))?
        };
        sender
            .send(frame)
            .await
            .map_err(|_| C2Error::AgentNotConnected(tag.to_string()))
    }

    /// Apply persisted labels to known agents.
    pub fn load_labels(&self, path: &Path) -> Result<()> {
        if !path.is_file() {
            return Ok(());
        }
        let data = std::fs::read_to_string(path)?;
        let labeled: Vec<LabeledAgent> = serde_json::from_str(&data)?;

        let mut inner = self.inner.write().unwrap();
        for l in labeled {
            if let Some(entry) = inner.map.get_mut(&l.tag) {
                if entry.control.label.is_empty() {
                    entry.control.label = l.label;
                }
            }
        }
        Ok(())
    }

    /// Persist labels, merging with whatever the sidecar already holds so
    /// labels of agents not currently connected survive.
    pub fn save_labels(&self, path: &Path) -> Result<()> {
        let mut old: Vec<LabeledAgent> = if path.is_file() {
            serde_json::from_str(&std::fs::read_to_string(path)?).unwrap_or_default()
        } else {
            Vec::new()
        };

        {
            let inner = self.inner.read().unwrap();
            for (tag, entry) in &inner.map {
                if entry.control.label.is_empty() {
                    continue;
                }
                match old.iter_mut().find(|l| &l.tag == tag) {
                    Some(existing) => existing.label = entry.control.label.clone(),
                    None => old.push(LabeledAgent {
                        tag: tag.clone(),
                        label: entry.control.label.clone(),
                    }),
                }
            }
        }

        if old.is_empty() {
            return Ok(());
        }
        std::fs::write(path, serde_json::to_string_pretty(&old)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn agent(tag: &str) -> Agent {
        Agent {
            tag: tag.to_string(),
            hostname: format!("host-{tag}"),
            ..Default::default()
        }
    }

    fn sender() -> mpsc::Sender<Bytes> {
        mpsc::channel(8).0
    }

    #[test]
    fn register_assigns_dense_indices() {
        let reg = AgentRegistry::new();
        for i in 1..=5 {
            let (index, is_new) = reg.register(agent(&format!("tag{i}")));
            assert_eq!(index, i);
            assert!(is_new);
        }
        let indices: Vec<usize> = reg.list_connected().iter().map(|l| l.index).collect();
        assert_eq!(indices, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn reregister_keeps_index_and_label() {
        let reg = AgentRegistry::new();
        let (index, _) = reg.register(agent("t1"));
        reg.set_label("t1", "dbhost").unwrap();

        let mut updated = agent("t1");
        updated.hostname = "renamed".to_string();
        let (index2, is_new) = reg.register(updated);

        assert_eq!(index, index2);
        assert!(!is_new);
        let listing = &reg.list_connected()[0];
        assert_eq!(listing.label, "dbhost");
        assert_eq!(listing.agent.hostname, "renamed");
    }

    #[test]
    fn attach_cancels_previous_conn() {
        let reg = AgentRegistry::new();
        reg.register(agent("t1"));
        let first = reg.attach_conn("t1", sender(), 1).unwrap();
        assert!(!first.is_cancelled());

        let second = reg.attach_conn("t1", sender(), 2).unwrap();
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
        assert_eq!(reg.get_by_conn(2).unwrap().tag, "t1");
        assert!(reg.get_by_conn(1).is_none());
    }

    #[test]
    fn detach_respects_conn_ownership() {
        let reg = AgentRegistry::new();
        reg.register(agent("t1"));
        reg.attach_conn("t1", sender(), 1).unwrap();
        let token = reg.attach_conn("t1", sender(), 2).unwrap();

        // stale connection going away must not clobber the live one
        reg.detach_conn("t1", 1);
        assert!(reg.is_connected("t1"));
        assert!(!token.is_cancelled());

        reg.detach_conn("t1", 2);
        assert!(!reg.is_connected("t1"));
        assert!(token.is_cancelled());
        assert!(reg.contains("t1"), "record survives detach for the grace period");
    }

    #[test]
    fn grace_removal_spares_reconnected_agents() {
        let reg = AgentRegistry::new();
        reg.register(agent("t1"));
        reg.attach_conn("t1", sender(), 1).unwrap();
        reg.detach_conn("t1", 1);

        // reconnect before the sweep
        reg.attach_conn("t1", sender(), 2).unwrap();
        assert!(!reg.remove_if_disconnected("t1"));
        assert!(reg.contains("t1"));

        reg.detach_conn("t1", 2);
        assert!(reg.remove_if_disconnected("t1"));
        assert!(!reg.contains("t1"));
    }

    #[test]
    fn unregister_is_idempotent() {
        let reg = AgentRegistry::new();
        reg.register(agent("t1"));
        let token = reg.control_token("t1").unwrap();
        reg.unregister("t1");
        reg.unregister("t1");
        assert!(token.is_cancelled());
        assert!(reg.get_by_tag("t1").is_none());
    }

    #[test]
    fn concurrent_register_single_entry() {
        let reg = Arc::new(AgentRegistry::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let reg = reg.clone();
            handles.push(std::thread::spawn(move || {
                reg.register(agent("same-tag"));
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(reg.list_connected().len(), 1);
        assert_eq!(reg.index_of("same-tag"), Some(1));
    }

    #[tokio::test]
    async fn send_requires_connection() {
        let reg = AgentRegistry::new();
        let err = reg.send("ghost", Bytes::from_static(b"{}")).await.unwrap_err();
        assert!(matches!(err, C2Error::AgentUnknown(_)));

        reg.register(agent("t1"));
        let err = reg.send("t1", Bytes::from_static(b"{}")).await.unwrap_err();
        assert!(matches!(err, C2Error::AgentNotConnected(_)));

        let (tx, mut rx) = mpsc::channel(1);
        reg.attach_conn("t1", tx, 1).unwrap();
        reg.send("t1", Bytes::from_static(b"{}")).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"{}"));
    }

    #[test]
    fn label_sidecar_merge() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agents.json");
        std::fs::write(
            &path,
            r#"[{"tag": "offline-tag", "label": "kept"}, {"tag": "t1", "label": "stale"}]"#,
        )
        .unwrap();

        let reg = AgentRegistry::new();
        reg.register(agent("t1"));
        reg.set_label("t1", "fresh").unwrap();
        reg.save_labels(&path).unwrap();

        let saved: Vec<LabeledAgent> =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(saved.len(), 2);
        assert!(saved.iter().any(|l| l.tag == "offline-tag" && l.label == "kept"));
        assert!(saved.iter().any(|l| l.tag == "t1" && l.label == "fresh"));

        // a new registry picks the label back up on load
        let reg2 = AgentRegistry::new();
        reg2.register(agent("t1"));
        reg2.load_labels(&path).unwrap();
        assert_eq!(reg2.list_connected()[0].label, "fresh");
    }
}
