// SPDX-License-Identifier: Apache-2.0

//! Client entities, desired-key tracking and the bounded event log.
//!
//! A task is kept alive while any client wants it or any live task depends
//! on it. When a client disconnects its event log is not dropped right
//! away: a cleanup deadline is armed, and a reconnect with the same id
//! before expiry keeps the log.

use crate::task::TaskId;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Instant;

/// One connected (or recently connected) client.
#[derive(Debug)]
pub struct ClientState {
    /// The client-chosen identifier.
    pub id: String,
    /// Keys the client holds futures for.
    pub wants_what: HashSet<TaskId>,
    /// Opaque software-version fingerprint.
    pub versions: serde_json::Value,
    /// When the client was last heard from.
    pub last_seen: Instant,
}

/// Owner of all [`ClientState`] entities plus the per-topic event logs.
#[derive(Debug)]
pub struct ClientRegistry {
    clients: HashMap<String, ClientState>,
    events: HashMap<String, VecDeque<(u64, serde_json::Value)>>,
    /// Topics whose owner disconnected, with the deadline after which the
    /// log is dropped.
    retiring: HashMap<String, Instant>,
    event_seq: u64,
    log_length: usize,
}

impl ClientRegistry {
    /// Creates an empty registry retaining at most `log_length` events per
    /// topic.
    #[must_use]
    pub fn new(log_length: usize) -> Self {
        Self {
            clients: HashMap::new(),
            events: HashMap::new(),
            retiring: HashMap::new(),
            event_seq: 0,
            log_length,
        }
    }

    /// Number of connected clients.
    #[must_use]
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Whether no client is connected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Fallible lookup by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&ClientState> {
        self.clients.get(id)
    }

    /// Iterates over all connected clients.
    pub fn iter(&self) -> impl Iterator<Item = &ClientState> {
        self.clients.values()
    }

    /// Registers a client. Reconnecting with a known id refreshes
    /// `last_seen` and disarms any pending event-log cleanup.
    pub fn add_client(&mut self, id: &str, versions: serde_json::Value, now: Instant) {
        let _ = self.retiring.remove(id);
        let entry = self
            .clients
            .entry(id.to_owned())
            .or_insert_with(|| ClientState {
                id: id.to_owned(),
                wants_what: HashSet::new(),
                versions: serde_json::Value::Null,
                last_seen: now,
            });
        entry.versions = versions;
        entry.last_seen = now;
    }

    /// Removes a client, arming the event-log cleanup deadline. Returns the
    /// keys only this client was holding on to, for the scheduler to
    /// dereference.
    pub fn remove_client(&mut self, id: &str, cleanup_deadline: Instant) -> Vec<TaskId> {
        let Some(client) = self.clients.remove(id) else {
            return Vec::new();
        };
        if self.events.contains_key(id) {
            let _ = self.retiring.insert(id.to_owned(), cleanup_deadline);
        }
        client.wants_what.into_iter().collect()
    }

    /// Records that `client` wants `task`. Returns false when the client is
    /// unknown.
    pub fn want(&mut self, client: &str, task: TaskId) -> bool {
        match self.clients.get_mut(client) {
            Some(state) => {
                let _ = state.wants_what.insert(task);
                true
            }
            None => false,
        }
    }

    /// Records that `client` no longer wants `task`.
    pub fn unwant(&mut self, client: &str, task: TaskId) {
        if let Some(state) = self.clients.get_mut(client) {
            let _ = state.wants_what.remove(&task);
        }
    }

    /// Scrubs a forgotten task from every client's desired set.
    pub fn forget_task(&mut self, task: TaskId) {
        for state in self.clients.values_mut() {
            let _ = state.wants_what.remove(&task);
        }
    }

    /// Appends an event to a topic, trimming the log to the configured
    /// bound.
    pub fn log_event(&mut self, topic: &str, payload: serde_json::Value) {
        self.event_seq += 1;
        let log = self.events.entry(topic.to_owned()).or_default();
        log.push_back((self.event_seq, payload));
        while log.len() > self.log_length {
            let _ = log.pop_front();
        }
    }

    /// The retained events of a topic, oldest first.
    #[must_use]
    pub fn events(&self, topic: &str) -> Option<&VecDeque<(u64, serde_json::Value)>> {
        self.events.get(topic)
    }

    /// Drops the event logs of disconnected clients whose cleanup deadline
    /// has passed. Returns the dropped topics.
    pub fn expire_events(&mut self, now: Instant) -> Vec<String> {
        let expired: Vec<String> = self
            .retiring
            .iter()
            .filter(|(_, deadline)| now >= **deadline)
            .map(|(topic, _)| topic.clone())
            .collect();
        for topic in &expired {
            let _ = self.retiring.remove(topic);
            let _ = self.events.remove(topic);
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    #[test]
    fn wants_are_tracked_per_client() {
        let mut registry = ClientRegistry::new(10);
        let now = Instant::now();
        registry.add_client("c1", serde_json::Value::Null, now);
        let task = TaskId::default();
        assert!(registry.want("c1", task));
        assert!(!registry.want("ghost", task));
        registry.unwant("c1", task);
        assert!(registry.get("c1").expect("present").wants_what.is_empty());
    }

    #[test]
    fn remove_client_returns_held_keys() {
        let mut registry = ClientRegistry::new(10);
        let now = Instant::now();
        registry.add_client("c1", serde_json::Value::Null, now);
        let task = TaskId::default();
        let _ = registry.want("c1", task);
        let released = registry.remove_client("c1", now + Duration::from_secs(60));
        assert_eq!(released, vec![task]);
        assert!(registry.get("c1").is_none());
    }

    #[test]
    fn event_log_is_bounded() {
        let mut registry = ClientRegistry::new(3);
        for i in 0..5 {
            registry.log_event("c1", serde_json::json!({ "i": i }));
        }
        let log = registry.events("c1").expect("topic exists");
        assert_eq!(log.len(), 3);
        assert_eq!(log.front().expect("nonempty").1, serde_json::json!({"i": 2}));
    }

    #[test]
    fn events_survive_until_cleanup_deadline() {
        let mut registry = ClientRegistry::new(10);
        let now = Instant::now();
        registry.add_client("c1", serde_json::Value::Null, now);
        registry.log_event("c1", serde_json::json!("hello"));
        let deadline = now + Duration::from_secs(60);
        let _ = registry.remove_client("c1", deadline);

        // Before the deadline nothing is dropped.
        assert!(registry.expire_events(now).is_empty());
        assert!(registry.events("c1").is_some());

        // Reconnecting disarms the cleanup.
        registry.add_client("c1", serde_json::Value::Null, now);
        assert!(registry.expire_events(deadline + Duration::from_secs(1)).is_empty());
        assert!(registry.events("c1").is_some());

        // Disconnecting again and letting the deadline pass drops the log.
        let _ = registry.remove_client("c1", deadline);
        let dropped = registry.expire_events(deadline + Duration::from_secs(1));
        assert_eq!(dropped, vec!["c1".to_owned()]);
        assert!(registry.events("c1").is_none());
    }
}
