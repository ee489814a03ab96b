use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;
use chrono::{DateTime, Local};

/// Per-request view handed to every detection stage.
///
/// Header names are stored lower-cased. Query parameters keep their raw
/// (still percent-encoded) form so that the payload scanner controls how many
/// decode passes happen.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub client_ip: String,

    pub method: String,

    pub path: String,

    pub query: Vec<(String, String)>,

    pub headers: HashMap<String, String>,

    pub body: Bytes,

    /// Wall-clock receive time in the server's local zone (used for
    /// time-of-day heuristics).
    pub received_at: DateTime<Local>,
}

impl RequestContext {
    pub fn new(client_ip: impl Into<String>, method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            client_ip: client_ip.into(),
            method: method.into().to_uppercase(),
            path: path.into(),
            query: Vec::new(),
            headers: HashMap::new(),
            body: Bytes::new(),
            received_at: Local::now(),
        }
    }

    /// Parse a raw query string (without the leading `?`).
    pub fn with_query(mut self, raw: &str) -> Self {
        self.query = parse_query(raw);
        self
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_lowercase(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_received_at(mut self, at: DateTime<Local>) -> Self {
        self.received_at = at;
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(|v| v.as_str())
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.headers.contains_key(name)
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.header("user-agent")
    }

    pub fn query_param_count(&self) -> usize {
        self.query.len()
    }

    /// Query parameters rendered as a JSON object (last value wins).
    pub fn serialized_query(&self) -> String {
        if self.query.is_empty() {
            return String::new();
        }
        let map: BTreeMap<&str, &str> = self
            .query
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        serde_json::to_string(&map).unwrap_or_default()
    }
}

fn parse_query(raw: &str) -> Vec<(String, String)> {
    raw.split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (pair.to_string(), String::new()),
        })
        .collect()
}
