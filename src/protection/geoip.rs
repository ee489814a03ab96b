use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use ipnet::IpNet;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::settings::{GeoConfig, GeoProviderConfig, GeoProviderKind};
use crate::error::{WafError, WafResult};

pub const LOCAL: &str = "LOCAL";
pub const UNKNOWN: &str = "UNKNOWN";

const LOCAL_PREFIXES: &[&str] = &["127.", "192.168.", "10.", "172.16.", "::1", "fc00:", "fe80:"];

/// Seed table used when every provider fails.
const STATIC_PREFIXES: &[(&str, &str)] = &[
    ("8.8.8.0/24", "US"),
    ("8.8.4.0/24", "US"),
    ("208.67.222.0/24", "US"),
    ("1.1.1.0/24", "AU"),
    ("9.9.9.0/24", "CH"),
    ("77.88.8.0/24", "RU"),
    ("114.114.114.0/24", "CN"),
    ("180.76.76.0/24", "CN"),
    ("168.126.63.0/24", "KR"),
    ("185.228.168.0/24", "GB"),
];

/// One step of the country lookup chain.
#[async_trait]
pub trait GeoProvider: Send + Sync {
    async fn country(&self, ip: &str) -> WafResult<Option<String>>;

    fn name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// HTTP JSON provider
// ---------------------------------------------------------------------------

/// Queries a JSON geolocation API; `{ip}` in the URL is substituted.
pub struct HttpGeoProvider {
    name: String,
    client: reqwest::Client,
    url_template: String,
    country_field: String,
}

impl HttpGeoProvider {
    pub fn new(name: &str, url_template: &str, country_field: &str) -> WafResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("shieldwall/", env!("CARGO_PKG_VERSION")))
            .no_proxy()
            .build()
            .map_err(|e| WafError::Configuration(format!("geo provider {}: {}", name, e)))?;
        Ok(Self {
            name: name.to_string(),
            client,
            url_template: url_template.to_string(),
            country_field: country_field.to_string(),
        })
    }
}

#[async_trait]
impl GeoProvider for HttpGeoProvider {
    async fn country(&self, ip: &str) -> WafResult<Option<String>> {
        let url = self.url_template.replace("{ip}", ip);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| WafError::pipeline("geo", format!("{}: {}", self.name, e)))?;
        if !response.status().is_success() {
            return Err(WafError::pipeline(
                "geo",
                format!("{} returned HTTP {}", self.name, response.status()),
            ));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| WafError::pipeline("geo", format!("{}: {}", self.name, e)))?;
        Ok(extract_field(&body, &self.country_field))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

fn extract_field(body: &Value, dotted: &str) -> Option<String> {
    let mut current = body;
    for part in dotted.split('.') {
        current = current.get(part)?;
    }
    current.as_str().map(|s| s.to_string())
}

// ---------------------------------------------------------------------------
// MaxMind database provider
// ---------------------------------------------------------------------------

#[derive(serde::Deserialize, Debug)]
struct GeoIpCountry {
    country: Option<CountryRecord>,
}

#[derive(serde::Deserialize, Debug)]
struct CountryRecord {
    iso_code: Option<String>,
}

/// Local MaxMind country or city database.
pub struct MaxMindGeoProvider {
    name: String,
    reader: maxminddb::Reader<Vec<u8>>,
}

impl MaxMindGeoProvider {
    pub fn open(name: &str, path: &str) -> WafResult<Self> {
        if !Path::new(path).exists() {
            return Err(WafError::Configuration(format!(
                "GeoIP database not found: {}",
                path
            )));
        }
        let reader = maxminddb::Reader::open_readfile(path)
            .map_err(|e| WafError::Configuration(format!("GeoIP database {}: {}", path, e)))?;
        info!(path = path, "GeoIP database loaded successfully");
        Ok(Self {
            name: name.to_string(),
            reader,
        })
    }
}

#[async_trait]
impl GeoProvider for MaxMindGeoProvider {
    async fn country(&self, ip: &str) -> WafResult<Option<String>> {
        let addr: IpAddr = match ip.parse() {
            Ok(addr) => addr,
            Err(_) => return Ok(None),
        };
        match self.reader.lookup::<GeoIpCountry>(addr) {
            Ok(result) => Ok(result.country.and_then(|c| c.iso_code)),
            Err(maxminddb::MaxMindDBError::AddressNotFoundError(_)) => Ok(None),
            Err(e) => Err(WafError::pipeline("geo", format!("{}: {}", self.name, e))),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

// ---------------------------------------------------------------------------
// GeoResolver
// ---------------------------------------------------------------------------

struct ProviderSlot {
    provider: Arc<dyn GeoProvider>,
    timeout: Duration,
}

/// Country resolution: local short-circuit, provider chain, static seed table.
pub struct GeoResolver {
    providers: Vec<ProviderSlot>,
    default_timeout: Duration,
    static_table: Vec<(IpNet, &'static str)>,
    cache: DashMap<String, (String, Instant)>,
    cache_ttl: Duration,
}

impl GeoResolver {
    pub fn new(config: &GeoConfig) -> Self {
        let default_timeout = Duration::from_millis(config.lookup_timeout_ms);
        let static_table = STATIC_PREFIXES
            .iter()
            .filter_map(|(cidr, country)| cidr.parse::<IpNet>().ok().map(|net| (net, *country)))
            .collect();
        Self {
            providers: Vec::new(),
            default_timeout,
            static_table,
            cache: DashMap::new(),
            cache_ttl: Duration::from_secs(config.cache_ttl_secs),
        }
    }

    /// Build a resolver with every configured provider that can be opened.
    pub fn from_config(config: &GeoConfig) -> Self {
        let mut resolver = Self::new(config);
        for provider_config in &config.providers {
            match build_provider(provider_config) {
                Ok(provider) => {
                    let timeout = provider_config
                        .timeout_ms
                        .map(Duration::from_millis)
                        .unwrap_or(resolver.default_timeout);
                    resolver = resolver.with_provider(provider, timeout);
                }
                Err(e) => warn!(provider = %provider_config.name, error = %e, "Skipping geo provider"),
            }
        }
        info!(providers = resolver.providers.len(), "Geo resolver initialized");
        resolver
    }

    pub fn with_provider(mut self, provider: Arc<dyn GeoProvider>, timeout: Duration) -> Self {
        self.providers.push(ProviderSlot { provider, timeout });
        self
    }

    pub fn is_local(ip: &str) -> bool {
        LOCAL_PREFIXES.iter().any(|prefix| ip.starts_with(prefix))
    }

    /// Upper-case ISO country code, `LOCAL`, or `UNKNOWN`.
    pub async fn get_country(&self, ip: &str) -> String {
        if Self::is_local(ip) {
            return LOCAL.to_string();
        }

        if let Some(entry) = self.cache.get(ip) {
            if entry.1.elapsed() < self.cache_ttl {
                return entry.0.clone();
            }
        }

        let country = self.resolve(ip).await;
        self.cache
            .insert(ip.to_string(), (country.clone(), Instant::now()));
        country
    }

    async fn resolve(&self, ip: &str) -> String {
        for slot in &self.providers {
            let name = slot.provider.name();
            match tokio::time::timeout(slot.timeout, slot.provider.country(ip)).await {
                Ok(Ok(Some(code))) => {
                    let code = code.trim();
                    if code.len() >= 2 && code.chars().all(|c| c.is_ascii_alphabetic()) {
                        debug!(ip = %ip, provider = %name, country = %code, "Country resolved");
                        return code.to_ascii_uppercase();
                    }
                }
                Ok(Ok(None)) => {}
                Ok(Err(e)) => debug!(ip = %ip, provider = %name, error = %e, "Geo provider failed"),
                Err(_) => {
                    let e = WafError::LookupTimeout {
                        source_name: name.to_string(),
                        timeout_ms: slot.timeout.as_millis() as u64,
                    };
                    debug!(ip = %ip, error = %e, "Geo provider timed out");
                }
            }
        }
        self.static_lookup(ip).unwrap_or(UNKNOWN).to_string()
    }

    fn static_lookup(&self, ip: &str) -> Option<&'static str> {
        let addr: IpAddr = ip.parse().ok()?;
        self.static_table
            .iter()
            .find(|(net, _)| net.contains(&addr))
            .map(|(_, country)| *country)
    }

    pub fn cleanup(&self) -> usize {
        let expired: Vec<String> = self
            .cache
            .iter()
            .filter(|entry| entry.value().1.elapsed() >= self.cache_ttl)
            .map(|entry| entry.key().clone())
            .collect();
        let count = expired.len();
        for ip in expired {
            self.cache.remove(&ip);
        }
        count
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }
}

fn build_provider(config: &GeoProviderConfig) -> WafResult<Arc<dyn GeoProvider>> {
    match config.kind {
        GeoProviderKind::Http => {
            let url = config.url.as_deref().unwrap_or_default();
            Ok(Arc::new(HttpGeoProvider::new(&config.name, url, &config.country_field)?))
        }
        GeoProviderKind::Maxmind => {
            let path = config.db_path.as_deref().unwrap_or_default();
            Ok(Arc::new(MaxMindGeoProvider::open(&config.name, path)?))
        }
    }
}
