pub mod events;
pub mod memory;
pub mod sqlite;

use crate::error::WafResult;
use crate::models::event::ThreatIntelligence;

/// Persistent side of IP reputation: cached records plus the blocked set.
pub trait ReputationStore: Send + Sync {
    fn get(&self, ip: &str) -> WafResult<Option<ThreatIntelligence>>;

    fn set(&self, ip: &str, record: &ThreatIntelligence, ttl_secs: u64) -> WafResult<()>;

    fn add_to_blocked_set(&self, ip: &str) -> WafResult<()>;

    fn remove_from_blocked_set(&self, ip: &str) -> WafResult<()>;

    fn is_in_blocked_set(&self, ip: &str) -> WafResult<bool>;

    /// Drop expired records. Returns how many were removed.
    fn purge_expired(&self) -> WafResult<usize>;

    fn blocked_count(&self) -> WafResult<usize>;
}
