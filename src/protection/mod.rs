pub mod anomaly;
pub mod bot_detector;
pub mod challenge;
pub mod geoip;
pub mod ip_reputation;
pub mod patterns;
pub mod payload;
pub mod pipeline;
pub mod rate_limiter;
