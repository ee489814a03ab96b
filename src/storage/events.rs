use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;

use crate::models::event::SecurityEvent;

/// Bounded buffer of recent security events, oldest evicted first.
pub struct EventStore {
    events: RwLock<VecDeque<Arc<SecurityEvent>>>,
    capacity: usize,
}

impl EventStore {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: RwLock::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
        }
    }

    pub fn push(&self, event: SecurityEvent) -> Arc<SecurityEvent> {
        let event = Arc::new(event);
        let mut events = self.events.write();
        while events.len() >= self.capacity {
            events.pop_front();
        }
        events.push_back(Arc::clone(&event));
        event
    }

    /// Events for `ip` with a timestamp at or after `since`.
    pub fn events_for_ip_since(&self, ip: &str, since: DateTime<Utc>) -> Vec<Arc<SecurityEvent>> {
        self.events
            .read()
            .iter()
            .filter(|e| e.ip_address() == ip && e.timestamp() >= since)
            .cloned()
            .collect()
    }

    /// Up to `limit` events, newest first.
    pub fn recent(&self, limit: usize) -> Vec<Arc<SecurityEvent>> {
        self.events.read().iter().rev().take(limit).cloned().collect()
    }

    pub fn find(&self, id: &str) -> Option<Arc<SecurityEvent>> {
        self.events.read().iter().rev().find(|e| e.id() == id).cloned()
    }

    pub fn counts_by_type(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for event in self.events.read().iter() {
            *counts.entry(event.event_type().to_string()).or_insert(0) += 1;
        }
        counts
    }

    pub fn counts_by_severity(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for event in self.events.read().iter() {
            *counts.entry(event.severity().to_string()).or_insert(0) += 1;
        }
        counts
    }

    /// Drop events older than `retention_secs`. Returns how many were removed.
    pub fn cleanup(&self, retention_secs: i64) -> usize {
        let cutoff = Utc::now() - Duration::seconds(retention_secs);
        let mut events = self.events.write();
        let before = events.len();
        events.retain(|e| e.timestamp() >= cutoff);
        before - events.len()
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
