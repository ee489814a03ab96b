use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use futures_util::future::join_all;
use ipnet::IpNet;
use tracing::{debug, info, warn};

use crate::config::settings::{ProtectionConfig, ReputationConfig};
use crate::error::{WafError, WafResult};
use crate::models::event::ThreatIntelligence;
use crate::storage::events::EventStore;
use crate::storage::ReputationStore;

pub const INTERNAL_SOURCE: &str = "internal";

// ---------------------------------------------------------------------------
// External sources
// ---------------------------------------------------------------------------

/// Verdict from one external intelligence feed.
#[derive(Debug, Clone, Default)]
pub struct ExternalReputation {
    pub reputation: u32,
    pub is_malicious: bool,
    pub is_bot: bool,
    pub categories: BTreeSet<String>,
    pub confidence: f64,
}

/// Third-party reputation feed consulted when a record is recomputed.
#[async_trait]
pub trait ReputationSource: Send + Sync {
    /// `Ok(None)` means the source has no opinion on this address.
    async fn lookup(&self, ip: &str) -> WafResult<Option<ExternalReputation>>;

    fn name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// Whitelist
// ---------------------------------------------------------------------------

/// Addresses and CIDR ranges exempt from reputation checks.
#[derive(Debug, Clone, Default)]
pub struct IpWhitelist {
    networks: Vec<IpNet>,
    literals: Vec<String>,
}

impl IpWhitelist {
    pub fn new(entries: &[String]) -> Self {
        let mut whitelist = Self::default();
        for entry in entries {
            let entry = entry.trim();
            if let Ok(net) = entry.parse::<IpNet>() {
                whitelist.networks.push(net);
            } else if let Ok(addr) = entry.parse::<IpAddr>() {
                whitelist.networks.push(IpNet::from(addr));
            } else if !entry.is_empty() {
                warn!(entry = %entry, "Whitelist entry is not an IP or CIDR; matching literally");
                whitelist.literals.push(entry.to_string());
            }
        }
        whitelist
    }

    pub fn contains(&self, ip: &str) -> bool {
        if self.literals.iter().any(|l| l == ip) {
            return true;
        }
        match ip.parse::<IpAddr>() {
            Ok(addr) => self.networks.iter().any(|net| net.contains(&addr)),
            Err(_) => false,
        }
    }

    pub fn len(&self) -> usize {
        self.networks.len() + self.literals.len()
    }
}

// ---------------------------------------------------------------------------
// ReputationCache
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ReputationLookup {
    pub intel: ThreatIntelligence,
    pub blocked: bool,
    pub cached: bool,
}

#[derive(Debug, Clone)]
struct CachedIntel {
    intel: ThreatIntelligence,
    cached_at: Instant,
}

/// Per-IP `ThreatIntelligence`, recomputed from recent events and external
/// sources at most once per TTL.
pub struct ReputationCache {
    cache: DashMap<String, CachedIntel>,
    events: Arc<EventStore>,
    store: Arc<dyn ReputationStore>,
    sources: Vec<Arc<dyn ReputationSource>>,
    whitelist: IpWhitelist,
    ttl: Duration,
    block_threshold: u32,
    event_window: chrono::Duration,
    lookup_timeout: Duration,
}

impl ReputationCache {
    pub fn new(
        config: &ReputationConfig,
        protection: &ProtectionConfig,
        events: Arc<EventStore>,
        store: Arc<dyn ReputationStore>,
    ) -> Self {
        let whitelist = IpWhitelist::new(&protection.whitelisted_ips);
        info!(
            ttl_secs = config.cache_ttl_secs,
            block_threshold = config.block_threshold,
            whitelist_entries = whitelist.len(),
            "IP reputation cache initialized"
        );
        Self {
            cache: DashMap::new(),
            events,
            store,
            sources: Vec::new(),
            whitelist,
            ttl: Duration::from_secs(config.cache_ttl_secs),
            block_threshold: config.block_threshold,
            event_window: chrono::Duration::seconds(config.event_window_secs),
            lookup_timeout: Duration::from_millis(config.lookup_timeout_ms),
        }
    }

    pub fn with_source(mut self, source: Arc<dyn ReputationSource>) -> Self {
        info!(source = %source.name(), "Registered external reputation source");
        self.sources.push(source);
        self
    }

    pub fn is_whitelisted(&self, ip: &str) -> bool {
        self.whitelist.contains(ip)
    }

    /// Reputation for `ip`, or `None` when the address is whitelisted.
    pub async fn get_reputation(&self, ip: &str) -> Option<ReputationLookup> {
        if self.whitelist.contains(ip) {
            return None;
        }

        if let Some(entry) = self.cache.get(ip) {
            if entry.cached_at.elapsed() < self.ttl {
                let intel = entry.intel.clone();
                drop(entry);
                let blocked = self.is_blocking(&intel) || self.is_blocked(ip);
                return Some(ReputationLookup {
                    intel,
                    blocked,
                    cached: true,
                });
            }
        }

        let intel = self.compute(ip).await;
        let blocked = self.is_blocking(&intel);

        self.cache.insert(
            ip.to_string(),
            CachedIntel {
                intel: intel.clone(),
                cached_at: Instant::now(),
            },
        );
        if let Err(e) = self.store.set(ip, &intel, self.ttl.as_secs()) {
            warn!(ip = %ip, error = %e, "Failed to persist reputation record");
        }
        if blocked {
            if let Err(e) = self.store.add_to_blocked_set(ip) {
                warn!(ip = %ip, error = %e, "Failed to add IP to blocked set");
            }
        }

        let blocked = blocked || self.is_blocked(ip);
        debug!(
            ip = %ip,
            reputation = intel.reputation(),
            malicious = intel.is_malicious,
            blocked = blocked,
            "Reputation recomputed"
        );
        Some(ReputationLookup {
            intel,
            blocked,
            cached: false,
        })
    }

    fn is_blocking(&self, intel: &ThreatIntelligence) -> bool {
        intel.reputation() >= self.block_threshold || intel.is_malicious
    }

    async fn compute(&self, ip: &str) -> ThreatIntelligence {
        let mut intel = ThreatIntelligence::empty(ip);
        intel.sources.insert(INTERNAL_SOURCE.to_string());

        let since = Utc::now() - self.event_window;
        let recent: Vec<_> = self
            .events
            .events_for_ip_since(ip, since)
            .into_iter()
            .filter(|e| !e.cleared())
            .collect();
        let internal: u32 = recent
            .iter()
            .map(|e| e.severity().reputation_weight())
            .fold(0u32, |acc, w| acc.saturating_add(w));
        for event in &recent {
            intel.categories.insert(event.event_type().to_string());
        }
        if let Some(latest) = recent.iter().map(|e| e.timestamp()).max() {
            intel.last_seen = latest;
        }
        intel.is_bot = intel.categories.contains("bot_detected");
        intel.confidence = (recent.len() as f64 / 10.0).min(1.0);
        intel.set_reputation(internal);

        for (name, result) in self.query_sources(ip).await {
            match result {
                Ok(Some(ext)) => {
                    intel.set_reputation(intel.reputation().max(ext.reputation));
                    intel.is_malicious |= ext.is_malicious;
                    intel.is_bot |= ext.is_bot;
                    intel.categories.extend(ext.categories);
                    intel.confidence = intel.confidence.max(ext.confidence.clamp(0.0, 1.0));
                    intel.sources.insert(name);
                }
                Ok(None) => {}
                Err(e) => warn!(ip = %ip, source = %name, error = %e, "Reputation source failed"),
            }
        }
        intel
    }

    async fn query_sources(&self, ip: &str) -> Vec<(String, WafResult<Option<ExternalReputation>>)> {
        let timeout = self.lookup_timeout;
        let lookups = self.sources.iter().map(|source| async move {
            let name = source.name().to_string();
            let result = match tokio::time::timeout(timeout, source.lookup(ip)).await {
                Ok(result) => result,
                Err(_) => Err(WafError::LookupTimeout {
                    source_name: name.clone(),
                    timeout_ms: timeout.as_millis() as u64,
                }),
            };
            (name, result)
        });
        join_all(lookups).await
    }

    /// Membership in the persistent blocked set. Store failures count as not blocked.
    pub fn is_blocked(&self, ip: &str) -> bool {
        match self.store.is_in_blocked_set(ip) {
            Ok(blocked) => blocked,
            Err(e) => {
                warn!(ip = %ip, error = %e, "Blocked-set lookup failed");
                false
            }
        }
    }

    /// Last persisted record for `ip`, if still within its TTL.
    pub fn persisted(&self, ip: &str) -> WafResult<Option<ThreatIntelligence>> {
        self.store.get(ip)
    }

    pub fn unblock(&self, ip: &str) -> WafResult<()> {
        self.store.remove_from_blocked_set(ip)?;
        self.cache.remove(ip);
        info!(ip = %ip, "IP removed from blocked set");
        Ok(())
    }

    /// Evict expired cache entries and purge the backing store.
    pub fn cleanup(&self) -> usize {
        let expired: Vec<String> = self
            .cache
            .iter()
            .filter(|entry| entry.cached_at.elapsed() >= self.ttl)
            .map(|entry| entry.key().clone())
            .collect();
        let mut removed = 0;
        for ip in expired {
            if self
                .cache
                .remove_if(&ip, |_, c| c.cached_at.elapsed() >= self.ttl)
                .is_some()
            {
                removed += 1;
            }
        }
        if let Err(e) = self.store.purge_expired() {
            warn!(error = %e, "Failed to purge expired reputation records");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn blocked_count(&self) -> usize {
        self.store.blocked_count().unwrap_or(0)
    }
}
