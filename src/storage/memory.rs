use chrono::{DateTime, Duration, Utc};
use dashmap::{DashMap, DashSet};

use super::ReputationStore;
use crate::error::WafResult;
use crate::models::event::ThreatIntelligence;

// Keeps `now + ttl` representable.
const MAX_TTL_SECS: i64 = 100 * 365 * 24 * 3600;

#[derive(Debug, Clone)]
struct StoredRecord {
    record: ThreatIntelligence,
    expires_at: DateTime<Utc>,
}

/// Process-local reputation store. Lost on restart.
pub struct MemoryReputationStore {
    records: DashMap<String, StoredRecord>,
    blocked: DashSet<String>,
}

impl MemoryReputationStore {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            blocked: DashSet::new(),
        }
    }
}

impl Default for MemoryReputationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ReputationStore for MemoryReputationStore {
    fn get(&self, ip: &str) -> WafResult<Option<ThreatIntelligence>> {
        if let Some(entry) = self.records.get(ip) {
            if Utc::now() < entry.expires_at {
                return Ok(Some(entry.record.clone()));
            }
            drop(entry);
            self.records.remove(ip);
        }
        Ok(None)
    }

    fn set(&self, ip: &str, record: &ThreatIntelligence, ttl_secs: u64) -> WafResult<()> {
        let ttl = Duration::seconds(i64::try_from(ttl_secs).unwrap_or(MAX_TTL_SECS).min(MAX_TTL_SECS));
        self.records.insert(
            ip.to_string(),
            StoredRecord {
                record: record.clone(),
                expires_at: Utc::now() + ttl,
            },
        );
        Ok(())
    }

    fn add_to_blocked_set(&self, ip: &str) -> WafResult<()> {
        self.blocked.insert(ip.to_string());
        Ok(())
    }

    fn remove_from_blocked_set(&self, ip: &str) -> WafResult<()> {
        self.blocked.remove(ip);
        Ok(())
    }

    fn is_in_blocked_set(&self, ip: &str) -> WafResult<bool> {
        Ok(self.blocked.contains(ip))
    }

    fn purge_expired(&self) -> WafResult<usize> {
        let now = Utc::now();
        let expired: Vec<String> = self
            .records
            .iter()
            .filter(|entry| entry.expires_at <= now)
            .map(|entry| entry.key().clone())
            .collect();
        let mut removed = 0;
        for ip in expired {
            if self.records.remove_if(&ip, |_, r| r.expires_at <= now).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn blocked_count(&self) -> WafResult<usize> {
        Ok(self.blocked.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_and_blocked_set() {
        let store = MemoryReputationStore::new();
        let mut record = ThreatIntelligence::empty("9.9.9.9");
        record.set_reputation(80);
        store.set("9.9.9.9", &record, 60).unwrap();
        assert_eq!(store.get("9.9.9.9").unwrap().unwrap().reputation(), 80);

        store.add_to_blocked_set("9.9.9.9").unwrap();
        assert!(store.is_in_blocked_set("9.9.9.9").unwrap());
        store.remove_from_blocked_set("9.9.9.9").unwrap();
        assert!(!store.is_in_blocked_set("9.9.9.9").unwrap());
    }

    #[test]
    fn test_zero_ttl_expires_immediately() {
        let store = MemoryReputationStore::new();
        store.set("1.2.3.4", &ThreatIntelligence::empty("1.2.3.4"), 0).unwrap();
        assert!(store.get("1.2.3.4").unwrap().is_none());
        store.set("1.2.3.5", &ThreatIntelligence::empty("1.2.3.5"), 0).unwrap();
        assert_eq!(store.purge_expired().unwrap(), 1);
    }
}
