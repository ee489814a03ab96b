use super::settings::{
    AdminApiConfig, ChallengeConfig, EventsConfig, GeoConfig, LoggingConfig, ProtectionConfig,
    ReputationConfig, ServerConfig, StorageBackend, StorageConfig, UpstreamConfig,
};
use crate::models::threat::ResponseAction;

// ---------------------------------------------------------------------------
// Top-level struct defaults
// ---------------------------------------------------------------------------

pub fn default_server_config() -> ServerConfig {
    ServerConfig {
        bind: default_bind(),
        max_body_bytes: default_max_body_bytes(),
        listen_backlog: default_listen_backlog(),
    }
}

pub fn default_upstream_config() -> UpstreamConfig {
    UpstreamConfig {
        address: default_upstream_address(),
        response_timeout_ms: default_response_timeout_ms(),
    }
}

pub fn default_admin_api_config() -> AdminApiConfig {
    AdminApiConfig {
        bind: default_admin_bind(),
        api_key: default_api_key(),
    }
}

pub fn default_logging_config() -> LoggingConfig {
    LoggingConfig {
        level: default_log_level(),
        file: default_log_file(),
        access_log: default_access_log(),
    }
}

pub fn default_protection_config() -> ProtectionConfig {
    ProtectionConfig {
        whitelisted_ips: Vec::new(),
        per_ip_rate_limit: default_per_ip_rate_limit(),
        rate_limit_window_secs: default_rate_limit_window_secs(),
        skip_reputation_check: false,
        bot_score_threshold: default_bot_score_threshold(),
        suspicious_ua_threshold: None,
        anomaly_threshold: default_anomaly_threshold(),
        response_action: ResponseAction::default(),
        maintenance_interval_secs: default_maintenance_interval_secs(),
    }
}

pub fn default_geo_config() -> GeoConfig {
    GeoConfig {
        blocked_countries: Vec::new(),
        allowed_countries: Vec::new(),
        providers: Vec::new(),
        lookup_timeout_ms: default_lookup_timeout_ms(),
        cache_ttl_secs: default_geo_cache_ttl_secs(),
    }
}

pub fn default_reputation_config() -> ReputationConfig {
    ReputationConfig {
        cache_ttl_secs: default_reputation_cache_ttl_secs(),
        block_threshold: default_reputation_block_threshold(),
        event_window_secs: default_event_window_secs(),
        lookup_timeout_ms: default_lookup_timeout_ms(),
    }
}

pub fn default_events_config() -> EventsConfig {
    EventsConfig {
        capacity: default_event_capacity(),
        retention_secs: default_event_retention_secs(),
    }
}

pub fn default_challenge_config() -> ChallengeConfig {
    ChallengeConfig {
        verify_path: default_verify_path(),
        delay_ms: default_challenge_delay_ms(),
        challenge_ttl_secs: default_challenge_ttl_secs(),
        cookie_name: default_cookie_name(),
        cookie_max_age_secs: default_cookie_max_age_secs(),
        hmac_secret: default_hmac_secret(),
    }
}

pub fn default_storage_config() -> StorageConfig {
    StorageConfig {
        backend: default_storage_backend(),
        sqlite_path: default_sqlite_path(),
    }
}

// ---------------------------------------------------------------------------
// ServerConfig / UpstreamConfig field defaults
// ---------------------------------------------------------------------------

pub fn default_bind() -> String {
    "0.0.0.0:8080".to_string()
}

pub fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024
}

pub fn default_listen_backlog() -> i32 {
    4096
}

pub fn default_upstream_address() -> String {
    "127.0.0.1:3000".to_string()
}

pub fn default_response_timeout_ms() -> u64 {
    60_000
}

// ---------------------------------------------------------------------------
// AdminApiConfig field defaults
// ---------------------------------------------------------------------------

pub fn default_admin_bind() -> String {
    "127.0.0.1:9090".to_string()
}

pub fn default_api_key() -> String {
    // Empty disables the admin API (see main.rs).
    String::new()
}

// ---------------------------------------------------------------------------
// LoggingConfig field defaults
// ---------------------------------------------------------------------------

pub fn default_log_level() -> String {
    "info,shieldwall=debug".to_string()
}

pub fn default_log_file() -> String {
    "/var/log/shieldwall/shieldwall.log".to_string()
}

pub fn default_access_log() -> String {
    "/var/log/shieldwall/access.log".to_string()
}

// ---------------------------------------------------------------------------
// ProtectionConfig field defaults
// ---------------------------------------------------------------------------

pub fn default_per_ip_rate_limit() -> u64 {
    100
}

pub fn default_rate_limit_window_secs() -> u64 {
    60
}

pub fn default_bot_score_threshold() -> u32 {
    70
}

pub fn default_anomaly_threshold() -> u32 {
    85
}

pub fn default_maintenance_interval_secs() -> u64 {
    300
}

// ---------------------------------------------------------------------------
// GeoConfig / ReputationConfig field defaults
// ---------------------------------------------------------------------------

pub fn default_lookup_timeout_ms() -> u64 {
    2_000
}

pub fn default_geo_cache_ttl_secs() -> u64 {
    3_600
}

pub fn default_country_field() -> String {
    "country_code".to_string()
}

pub fn default_reputation_cache_ttl_secs() -> u64 {
    3_600
}

pub fn default_reputation_block_threshold() -> u32 {
    75
}

pub fn default_event_window_secs() -> i64 {
    86_400
}

// ---------------------------------------------------------------------------
// EventsConfig field defaults
// ---------------------------------------------------------------------------

pub fn default_event_capacity() -> usize {
    10_000
}

pub fn default_event_retention_secs() -> i64 {
    86_400
}

// ---------------------------------------------------------------------------
// ChallengeConfig field defaults
// ---------------------------------------------------------------------------

pub fn default_verify_path() -> String {
    "/__shieldwall/challenge/verify".to_string()
}

pub fn default_challenge_delay_ms() -> u64 {
    3_000
}

pub fn default_challenge_ttl_secs() -> u64 {
    300
}

pub fn default_cookie_name() -> String {
    "__shieldwall_clearance".to_string()
}

pub fn default_cookie_max_age_secs() -> u64 {
    1_800
}

pub fn default_hmac_secret() -> String {
    // Empty means a random per-process secret is generated at startup.
    String::new()
}

// ---------------------------------------------------------------------------
// StorageConfig field defaults
// ---------------------------------------------------------------------------

pub fn default_storage_backend() -> StorageBackend {
    StorageBackend::Memory
}

pub fn default_sqlite_path() -> String {
    "/var/lib/shieldwall/reputation.db".to_string()
}
