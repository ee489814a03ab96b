use std::fmt;

use serde::{Deserialize, Serialize};

/// Which detection stage produced a security event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityEventType {
    BotDetected,
    AnomalyDetected,
    RateLimitExceeded,
    GeoBlocked,
    ReputationBlocked,
}

impl fmt::Display for SecurityEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecurityEventType::BotDetected => write!(f, "bot_detected"),
            SecurityEventType::AnomalyDetected => write!(f, "anomaly_detected"),
            SecurityEventType::RateLimitExceeded => write!(f, "rate_limit_exceeded"),
            SecurityEventType::GeoBlocked => write!(f, "geo_blocked"),
            SecurityEventType::ReputationBlocked => write!(f, "reputation_blocked"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Contribution of one event of this severity to an IP's reputation.
    pub fn reputation_weight(&self) -> u32 {
        match self {
            Severity::Critical => 30,
            Severity::High => 20,
            Severity::Medium => 10,
            Severity::Low => 5,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// Outcome recorded on a security event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventAction {
    Allowed,
    Blocked,
    Challenged,
}

impl fmt::Display for EventAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventAction::Allowed => write!(f, "allowed"),
            EventAction::Blocked => write!(f, "blocked"),
            EventAction::Challenged => write!(f, "challenged"),
        }
    }
}

/// Configured response strategy for a request that tripped a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResponseAction {
    #[default]
    Block,
    Challenge,
    Monitor,
}

impl ResponseAction {
    pub fn event_action(&self) -> EventAction {
        match self {
            ResponseAction::Block => EventAction::Blocked,
            ResponseAction::Challenge => EventAction::Challenged,
            ResponseAction::Monitor => EventAction::Allowed,
        }
    }
}

impl fmt::Display for ResponseAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseAction::Block => write!(f, "block"),
            ResponseAction::Challenge => write!(f, "challenge"),
            ResponseAction::Monitor => write!(f, "monitor"),
        }
    }
}
