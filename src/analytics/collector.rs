use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;

use crate::models::metrics::MetricsSnapshot;

/// Per-second counters kept for the last hour.
#[derive(Clone, Debug, Serialize)]
pub struct SecondSnapshot {
    pub timestamp: u64,
    pub requests: u64,
    pub blocked: u64,
    pub challenged: u64,
    pub passed: u64,
}

/// How the proxy finished a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Allowed,
    Blocked,
    Challenged,
    /// Let through with an event recorded.
    Monitored,
    FailedOpen,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Allowed => "allowed",
            Outcome::Blocked => "blocked",
            Outcome::Challenged => "challenged",
            Outcome::Monitored => "monitored",
            Outcome::FailedOpen => "failed_open",
        }
    }
}

/// Lock-free request counters shared between the proxy and the admin API.
pub struct MetricsCollector {
    current_second_requests: AtomicU64,
    current_second_blocked: AtomicU64,
    current_second_challenged: AtomicU64,
    current_second_passed: AtomicU64,

    second_snapshots: RwLock<Vec<SecondSnapshot>>,

    ip_counts: DashMap<String, u64>,

    total_latency_us: AtomicU64,
    latency_count: AtomicU64,

    total_requests: AtomicU64,
    allowed: AtomicU64,
    blocked: AtomicU64,
    challenged: AtomicU64,
    monitored: AtomicU64,
    failed_open: AtomicU64,

    start_time: Instant,
}

const MAX_SNAPSHOTS: usize = 3600;

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            current_second_requests: AtomicU64::new(0),
            current_second_blocked: AtomicU64::new(0),
            current_second_challenged: AtomicU64::new(0),
            current_second_passed: AtomicU64::new(0),

            second_snapshots: RwLock::new(Vec::with_capacity(MAX_SNAPSHOTS)),

            ip_counts: DashMap::new(),

            total_latency_us: AtomicU64::new(0),
            latency_count: AtomicU64::new(0),

            total_requests: AtomicU64::new(0),
            allowed: AtomicU64::new(0),
            blocked: AtomicU64::new(0),
            challenged: AtomicU64::new(0),
            monitored: AtomicU64::new(0),
            failed_open: AtomicU64::new(0),

            start_time: Instant::now(),
        }
    }

    /// Record one finished request. `latency_us` is time spent in the pipeline.
    pub fn record_request(&self, ip: &str, outcome: Outcome, latency_us: u64) {
        self.current_second_requests.fetch_add(1, Ordering::Relaxed);
        self.total_requests.fetch_add(1, Ordering::Relaxed);

        match outcome {
            Outcome::Blocked => {
                self.current_second_blocked.fetch_add(1, Ordering::Relaxed);
                self.blocked.fetch_add(1, Ordering::Relaxed);
            }
            Outcome::Challenged => {
                self.current_second_challenged.fetch_add(1, Ordering::Relaxed);
                self.challenged.fetch_add(1, Ordering::Relaxed);
            }
            Outcome::Allowed => {
                self.current_second_passed.fetch_add(1, Ordering::Relaxed);
                self.allowed.fetch_add(1, Ordering::Relaxed);
            }
            Outcome::Monitored => {
                self.current_second_passed.fetch_add(1, Ordering::Relaxed);
                self.monitored.fetch_add(1, Ordering::Relaxed);
            }
            Outcome::FailedOpen => {
                self.current_second_passed.fetch_add(1, Ordering::Relaxed);
                self.failed_open.fetch_add(1, Ordering::Relaxed);
            }
        }

        self.ip_counts
            .entry(ip.to_string())
            .and_modify(|c| *c += 1)
            .or_insert(1);

        self.total_latency_us.fetch_add(latency_us, Ordering::Relaxed);
        self.latency_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Close the current second. Called once per second by a background task.
    pub fn tick(&self) {
        let requests = self.current_second_requests.swap(0, Ordering::Relaxed);
        let blocked = self.current_second_blocked.swap(0, Ordering::Relaxed);
        let challenged = self.current_second_challenged.swap(0, Ordering::Relaxed);
        let passed = self.current_second_passed.swap(0, Ordering::Relaxed);

        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        let mut snapshots = self.second_snapshots.write();
        if snapshots.len() >= MAX_SNAPSHOTS {
            snapshots.remove(0);
        }
        snapshots.push(SecondSnapshot {
            timestamp: now,
            requests,
            blocked,
            challenged,
            passed,
        });
    }

    pub fn current_rps(&self) -> f64 {
        let snapshots = self.second_snapshots.read();
        snapshots.last().map(|s| s.requests as f64).unwrap_or(0.0)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let latency_count = self.latency_count.load(Ordering::Relaxed);
        let avg_latency_us = if latency_count > 0 {
            self.total_latency_us.load(Ordering::Relaxed) as f64 / latency_count as f64
        } else {
            0.0
        };

        MetricsSnapshot {
            rps: self.current_rps(),
            unique_ips: self.ip_counts.len() as u64,
            total_requests: self.total_requests.load(Ordering::Relaxed),
            allowed: self.allowed.load(Ordering::Relaxed),
            blocked: self.blocked.load(Ordering::Relaxed),
            challenged: self.challenged.load(Ordering::Relaxed),
            monitored: self.monitored.load(Ordering::Relaxed),
            failed_open: self.failed_open.load(Ordering::Relaxed),
            avg_latency_ms: avg_latency_us / 1000.0,
            uptime_secs: self.start_time.elapsed().as_secs(),
        }
    }

    pub fn top_ips(&self, limit: usize) -> Vec<(String, u64)> {
        let mut entries: Vec<(String, u64)> = self
            .ip_counts
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        entries.truncate(limit);
        entries
    }

    pub fn second_history(&self, last_n: usize) -> Vec<SecondSnapshot> {
        let snapshots = self.second_snapshots.read();
        let len = snapshots.len();
        if last_n >= len {
            snapshots.clone()
        } else {
            snapshots[(len - last_n)..].to_vec()
        }
    }

    /// Forget per-IP counts. Totals are kept.
    pub fn reset_ip_counts(&self) {
        self.ip_counts.clear();
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
