use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Point-in-time view of the pipeline's in-memory state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStats {
    pub active_rate_limit_entries: usize,
    pub reputation_cache_size: usize,
    pub recent_event_count: usize,
    pub events_by_type: BTreeMap<String, usize>,
    pub events_by_severity: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub stats: Option<PipelineStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Request outcome counters since start-up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub rps: f64,

    pub unique_ips: u64,

    pub total_requests: u64,

    pub allowed: u64,

    pub blocked: u64,

    pub challenged: u64,

    pub monitored: u64,

    pub failed_open: u64,

    pub avg_latency_ms: f64,

    pub uptime_secs: u64,
}
