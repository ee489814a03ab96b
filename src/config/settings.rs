use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;

use super::defaults;
use crate::error::WafError;
use crate::models::threat::ResponseAction;

/// One week.
const MAX_RATE_LIMIT_WINDOW_SECS: u64 = 7 * 24 * 3600;
const MAX_HISTORY_SECS: i64 = 365 * 24 * 3600;

/// Top-level configuration for the Shieldwall request filter.
/// Deserializes from a TOML configuration file; every field has a default.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default = "defaults::default_server_config")]
    pub server: ServerConfig,

    #[serde(default = "defaults::default_upstream_config")]
    pub upstream: UpstreamConfig,

    #[serde(default = "defaults::default_admin_api_config")]
    pub admin_api: AdminApiConfig,

    #[serde(default = "defaults::default_logging_config")]
    pub logging: LoggingConfig,

    #[serde(default = "defaults::default_protection_config")]
    pub protection: ProtectionConfig,

    #[serde(default = "defaults::default_geo_config")]
    pub geo: GeoConfig,

    #[serde(default = "defaults::default_reputation_config")]
    pub reputation: ReputationConfig,

    #[serde(default = "defaults::default_events_config")]
    pub events: EventsConfig,

    #[serde(default = "defaults::default_challenge_config")]
    pub challenge: ChallengeConfig,

    #[serde(default)]
    pub rules: RulesConfig,

    #[serde(default = "defaults::default_storage_config")]
    pub storage: StorageConfig,
}

impl Settings {
    /// Load configuration from a TOML file at the given path.
    pub fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;
        let settings: Settings = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path))?;
        settings
            .validate()
            .with_context(|| format!("Invalid configuration in {}", path))?;
        Ok(settings)
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), WafError> {
        if self.protection.per_ip_rate_limit == 0 {
            return Err(WafError::Configuration(
                "protection.per_ip_rate_limit must be greater than zero".into(),
            ));
        }
        if self.protection.rate_limit_window_secs == 0 {
            return Err(WafError::Configuration(
                "protection.rate_limit_window_secs must be greater than zero".into(),
            ));
        }
        if self.protection.rate_limit_window_secs > MAX_RATE_LIMIT_WINDOW_SECS {
            return Err(WafError::Configuration(format!(
                "protection.rate_limit_window_secs must not exceed {}",
                MAX_RATE_LIMIT_WINDOW_SECS
            )));
        }
        for (name, secs) in [
            ("reputation.event_window_secs", self.reputation.event_window_secs),
            ("events.retention_secs", self.events.retention_secs),
        ] {
            if !(1..=MAX_HISTORY_SECS).contains(&secs) {
                return Err(WafError::Configuration(format!(
                    "{} must be between 1 and {}",
                    name, MAX_HISTORY_SECS
                )));
            }
        }
        if self.events.capacity == 0 {
            return Err(WafError::Configuration("events.capacity must be greater than zero".into()));
        }
        for provider in &self.geo.providers {
            match provider.kind {
                GeoProviderKind::Http if provider.url.as_deref().map_or(true, str::is_empty) => {
                    return Err(WafError::Configuration(format!(
                        "geo provider '{}' needs a url",
                        provider.name
                    )));
                }
                GeoProviderKind::Maxmind if provider.db_path.as_deref().map_or(true, str::is_empty) => {
                    return Err(WafError::Configuration(format!(
                        "geo provider '{}' needs a db_path",
                        provider.name
                    )));
                }
                _ => {}
            }
        }
        if self.storage.backend == StorageBackend::Sqlite && self.storage.sqlite_path.is_empty() {
            return Err(WafError::Configuration("storage.sqlite_path is empty".into()));
        }
        Ok(())
    }

    /// Threshold used to decide whether a scored client counts as a bot.
    pub fn bot_classification_threshold(&self) -> u32 {
        self.protection
            .suspicious_ua_threshold
            .unwrap_or(self.protection.bot_score_threshold)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: defaults::default_server_config(),
            upstream: defaults::default_upstream_config(),
            admin_api: defaults::default_admin_api_config(),
            logging: defaults::default_logging_config(),
            protection: defaults::default_protection_config(),
            geo: defaults::default_geo_config(),
            reputation: defaults::default_reputation_config(),
            events: defaults::default_events_config(),
            challenge: defaults::default_challenge_config(),
            rules: RulesConfig::default(),
            storage: defaults::default_storage_config(),
        }
    }
}

/// Front-end listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "defaults::default_bind")]
    pub bind: String,

    #[serde(default = "defaults::default_max_body_bytes")]
    pub max_body_bytes: usize,

    #[serde(default = "defaults::default_listen_backlog")]
    pub listen_backlog: i32,
}

/// Downstream application that receives allowed requests.
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "defaults::default_upstream_address")]
    pub address: String,

    #[serde(default = "defaults::default_response_timeout_ms")]
    pub response_timeout_ms: u64,
}

/// Admin API configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AdminApiConfig {
    #[serde(default = "defaults::default_admin_bind")]
    pub bind: String,

    #[serde(default = "defaults::default_api_key")]
    pub api_key: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "defaults::default_log_level")]
    pub level: String,

    #[serde(default = "defaults::default_log_file")]
    pub file: String,

    #[serde(default = "defaults::default_access_log")]
    pub access_log: String,
}

/// Detection thresholds and the response strategy.
#[derive(Debug, Clone, Deserialize)]
pub struct ProtectionConfig {
    /// Single addresses or CIDR ranges that bypass reputation checks.
    #[serde(default)]
    pub whitelisted_ips: Vec<String>,

    #[serde(default = "defaults::default_per_ip_rate_limit")]
    pub per_ip_rate_limit: u64,

    #[serde(default = "defaults::default_rate_limit_window_secs")]
    pub rate_limit_window_secs: u64,

    #[serde(default)]
    pub skip_reputation_check: bool,

    #[serde(default = "defaults::default_bot_score_threshold")]
    pub bot_score_threshold: u32,

    #[serde(default)]
    pub suspicious_ua_threshold: Option<u32>,

    #[serde(default = "defaults::default_anomaly_threshold")]
    pub anomaly_threshold: u32,

    #[serde(default)]
    pub response_action: ResponseAction,

    #[serde(default = "defaults::default_maintenance_interval_secs")]
    pub maintenance_interval_secs: u64,
}

/// Geographic policy and the country lookup chain.
#[derive(Debug, Clone, Deserialize)]
pub struct GeoConfig {
    #[serde(default)]
    pub blocked_countries: Vec<String>,

    #[serde(default)]
    pub allowed_countries: Vec<String>,

    /// Tried in order until one yields a country code.
    #[serde(default)]
    pub providers: Vec<GeoProviderConfig>,

    #[serde(default = "defaults::default_lookup_timeout_ms")]
    pub lookup_timeout_ms: u64,

    #[serde(default = "defaults::default_geo_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GeoProviderKind {
    Http,
    Maxmind,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeoProviderConfig {
    pub name: String,

    pub kind: GeoProviderKind,

    /// URL template; `{ip}` is replaced with the client address.
    #[serde(default)]
    pub url: Option<String>,

    /// Dotted path of the country code inside the JSON response.
    #[serde(default = "defaults::default_country_field")]
    pub country_field: String,

    #[serde(default)]
    pub db_path: Option<String>,

    /// Overrides `geo.lookup_timeout_ms` for this provider.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// IP reputation scoring and caching.
#[derive(Debug, Clone, Deserialize)]
pub struct ReputationConfig {
    #[serde(default = "defaults::default_reputation_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    #[serde(default = "defaults::default_reputation_block_threshold")]
    pub block_threshold: u32,

    #[serde(default = "defaults::default_event_window_secs")]
    pub event_window_secs: i64,

    #[serde(default = "defaults::default_lookup_timeout_ms")]
    pub lookup_timeout_ms: u64,
}

/// Recent security event buffer.
#[derive(Debug, Clone, Deserialize)]
pub struct EventsConfig {
    #[serde(default = "defaults::default_event_capacity")]
    pub capacity: usize,

    #[serde(default = "defaults::default_event_retention_secs")]
    pub retention_secs: i64,
}

/// Interactive challenge page and clearance cookie.
#[derive(Debug, Clone, Deserialize)]
pub struct ChallengeConfig {
    #[serde(default = "defaults::default_verify_path")]
    pub verify_path: String,

    #[serde(default = "defaults::default_challenge_delay_ms")]
    pub delay_ms: u64,

    #[serde(default = "defaults::default_challenge_ttl_secs")]
    pub challenge_ttl_secs: u64,

    #[serde(default = "defaults::default_cookie_name")]
    pub cookie_name: String,

    #[serde(default = "defaults::default_cookie_max_age_secs")]
    pub cookie_max_age_secs: u64,

    #[serde(default = "defaults::default_hmac_secret")]
    pub hmac_secret: String,
}

/// Optional external rule table replacing the built-in signatures.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RulesConfig {
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    Sqlite,
}

/// Persistent reputation store selection.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "defaults::default_storage_backend")]
    pub backend: StorageBackend,

    #[serde(default = "defaults::default_sqlite_path")]
    pub sqlite_path: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let settings: Settings = toml::from_str("").unwrap();
        assert_eq!(settings.protection.per_ip_rate_limit, 100);
        assert_eq!(settings.protection.rate_limit_window_secs, 60);
        assert_eq!(settings.protection.bot_score_threshold, 70);
        assert_eq!(settings.protection.anomaly_threshold, 85);
        assert_eq!(settings.protection.response_action, ResponseAction::Block);
        assert_eq!(settings.reputation.block_threshold, 75);
        assert_eq!(settings.events.capacity, 10_000);
        assert_eq!(settings.geo.lookup_timeout_ms, 2000);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_parses_sections() {
        let settings: Settings = toml::from_str(
            r#"
            [protection]
            per_ip_rate_limit = 5
            response_action = "challenge"
            suspicious_ua_threshold = 40

            [geo]
            blocked_countries = ["XX"]

            [[geo.providers]]
            name = "ipapi"
            kind = "http"
            url = "https://ipapi.co/{ip}/json/"
            country_field = "country_code"
            "#,
        )
        .unwrap();
        assert_eq!(settings.protection.per_ip_rate_limit, 5);
        assert_eq!(settings.protection.response_action, ResponseAction::Challenge);
        assert_eq!(settings.bot_classification_threshold(), 40);
        assert_eq!(settings.geo.blocked_countries, vec!["XX".to_string()]);
        assert_eq!(settings.geo.providers[0].kind, GeoProviderKind::Http);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_limit_and_missing_url() {
        let mut settings = Settings::default();
        settings.protection.per_ip_rate_limit = 0;
        assert!(matches!(settings.validate(), Err(WafError::Configuration(_))));

        let settings: Settings = toml::from_str(
            r#"
            [[geo.providers]]
            name = "broken"
            kind = "http"
            "#,
        )
        .unwrap();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validate_bounds_time_windows() {
        let mut settings = Settings::default();
        settings.protection.rate_limit_window_secs = 30 * 24 * 3600;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.events.retention_secs = 0;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.reputation.event_window_secs = i64::MAX;
        assert!(settings.validate().is_err());
    }
}
