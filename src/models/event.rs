use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::request::RequestContext;
use super::threat::{EventAction, SecurityEventType, Severity};

/// Detail key set on events let through by a clearance cookie.
pub const CLEARANCE_DETAIL: &str = "clearance";

const MAX_REPUTATION: u32 = 100;

/// A single recorded detection.
///
/// Fields are private and only readable through accessors: once constructed,
/// an event (and in particular its `action`) never changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: SecurityEventType,
    severity: Severity,
    ip_address: String,
    user_agent: String,
    path: String,
    method: String,
    timestamp: DateTime<Utc>,
    details: BTreeMap<String, Value>,
    action: EventAction,
    score: u32,
}

impl SecurityEvent {
    pub fn new(
        ctx: &RequestContext,
        event_type: SecurityEventType,
        severity: Severity,
        action: EventAction,
        score: u32,
        details: BTreeMap<String, Value>,
    ) -> Self {
        Self::at(ctx, event_type, severity, action, score, details, Utc::now())
    }

    pub fn at(
        ctx: &RequestContext,
        event_type: SecurityEventType,
        severity: Severity,
        action: EventAction,
        score: u32,
        details: BTreeMap<String, Value>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            event_type,
            severity,
            ip_address: ctx.client_ip.clone(),
            user_agent: ctx.user_agent().unwrap_or("").to_string(),
            path: ctx.path.clone(),
            method: ctx.method.clone(),
            timestamp,
            details,
            action,
            score,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn event_type(&self) -> SecurityEventType {
        self.event_type
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    pub fn ip_address(&self) -> &str {
        &self.ip_address
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn details(&self) -> &BTreeMap<String, Value> {
        &self.details
    }

    pub fn action(&self) -> EventAction {
        self.action
    }

    pub fn score(&self) -> u32 {
        self.score
    }

    /// Whether a clearance cookie let this request through.
    pub fn cleared(&self) -> bool {
        self.details.get(CLEARANCE_DETAIL) == Some(&Value::Bool(true))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Geolocation {
    pub country: Option<String>,
    pub region: Option<String>,
    pub city: Option<String>,
    pub asn: Option<u32>,
    pub org: Option<String>,
}

/// Aggregated risk picture for one IP.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreatIntelligence {
    pub ip_address: String,
    #[serde(deserialize_with = "clamped_reputation")]
    reputation: u32,
    pub categories: BTreeSet<String>,
    pub last_seen: DateTime<Utc>,
    pub sources: BTreeSet<String>,
    pub confidence: f64,
    pub is_bot: bool,
    pub is_malicious: bool,
    pub geolocation: Geolocation,
}

impl ThreatIntelligence {
    pub fn empty(ip: &str) -> Self {
        Self {
            ip_address: ip.to_string(),
            reputation: 0,
            categories: BTreeSet::new(),
            last_seen: Utc::now(),
            sources: BTreeSet::new(),
            confidence: 0.0,
            is_bot: false,
            is_malicious: false,
            geolocation: Geolocation::default(),
        }
    }

    pub fn reputation(&self) -> u32 {
        self.reputation
    }

    /// Set the reputation, clamped to [0, 100].
    pub fn set_reputation(&mut self, value: u32) {
        self.reputation = value.min(MAX_REPUTATION);
    }
}

fn clamped_reputation<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: serde::Deserializer<'de>,
{
    u32::deserialize(deserializer).map(|value| value.min(MAX_REPUTATION))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reputation_is_clamped_on_set_and_load() {
        let mut intel = ThreatIntelligence::empty("192.0.2.1");
        intel.set_reputation(250);
        assert_eq!(intel.reputation(), 100);

        let mut json = serde_json::to_value(&intel).unwrap();
        json["reputation"] = serde_json::json!(999);
        let loaded: ThreatIntelligence = serde_json::from_value(json).unwrap();
        assert_eq!(loaded.reputation(), 100);
    }

    #[test]
    fn test_cleared_reads_clearance_detail() {
        let ctx = RequestContext::new("192.0.2.2", "GET", "/");
        let mut details = BTreeMap::new();
        let plain = SecurityEvent::new(
            &ctx,
            SecurityEventType::BotDetected,
            Severity::High,
            EventAction::Challenged,
            70,
            details.clone(),
        );
        assert!(!plain.cleared());

        details.insert(CLEARANCE_DETAIL.to_string(), Value::Bool(true));
        let cleared = SecurityEvent::new(
            &ctx,
            SecurityEventType::BotDetected,
            Severity::High,
            EventAction::Allowed,
            70,
            details,
        );
        assert!(cleared.cleared());
    }
}
