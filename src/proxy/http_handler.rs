use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue, CACHE_CONTROL, CONTENT_TYPE, SET_COOKIE};
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Body;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client as HyperClient;
use hyper_util::rt::TokioExecutor;
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use crate::analytics::collector::{MetricsCollector, Outcome};
use crate::config::settings::Settings;
use crate::models::request::RequestContext;
use crate::protection::challenge::VerifyOutcome;
use crate::protection::pipeline::{ProtectionPipeline, Verdict, SECURITY_HEADERS};

use super::access_log::{self, AccessEntry, AccessLogger};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Headers never copied between client and upstream.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "te",
    "trailer",
    "upgrade",
    "host",
];

#[derive(Debug, Deserialize)]
struct VerifyRequest {
    #[serde(rename = "challengeId")]
    challenge_id: String,
}

/// Turns one inbound HTTP request into a pipeline verdict and the matching
/// response: forwarded upstream, 403, or 429.
pub struct HttpHandler {
    pipeline: Arc<ProtectionPipeline>,
    metrics: Arc<MetricsCollector>,
    upstream_client: HyperClient<HttpConnector, Full<Bytes>>,
    upstream_address: String,
    response_timeout: Duration,
    max_body_bytes: usize,
    access_log: Option<Arc<AccessLogger>>,
}

impl HttpHandler {
    pub fn new(pipeline: Arc<ProtectionPipeline>, metrics: Arc<MetricsCollector>, settings: &Settings) -> Self {
        let upstream_client = HyperClient::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(128)
            .build_http();

        let access_log_path = &settings.logging.access_log;
        let access_log = if !access_log_path.is_empty() {
            match AccessLogger::new(access_log_path) {
                Ok(logger) => {
                    info!(path = %access_log_path, "Access log enabled");
                    Some(Arc::new(logger))
                }
                Err(e) => {
                    error!(path = %access_log_path, error = %e, "Failed to open access log");
                    None
                }
            }
        } else {
            None
        };

        Self {
            pipeline,
            metrics,
            upstream_client,
            upstream_address: settings.upstream.address.clone(),
            response_timeout: Duration::from_millis(settings.upstream.response_timeout_ms),
            max_body_bytes: settings.server.max_body_bytes,
            access_log,
        }
    }

    /// Process one request end to end. `peer` is the socket address, if known.
    pub async fn handle<B>(&self, req: Request<B>, peer: Option<IpAddr>) -> Response<Full<Bytes>>
    where
        B: Body + Send,
        B::Data: Send,
        B::Error: Into<BoxError>,
    {
        let start = Instant::now();
        let (parts, body) = req.into_parts();
        let ip = client_ip(&parts.headers, peer);
        let path = parts.uri.path().to_string();
        let query = parts.uri.query().map(|q| q.to_string());

        debug!(client_ip = %ip, method = %parts.method, path = %path, "Incoming request");

        let body = match Limited::new(body, self.max_body_bytes).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                warn!(client_ip = %ip, path = %path, error = %e, "Rejecting request body");
                return payload_too_large();
            }
        };

        if path == self.pipeline.challenge().verify_path() {
            return self.handle_challenge_verification(&parts.method, &body, &ip);
        }

        let mut ctx = RequestContext::new(ip.clone(), parts.method.as_str(), path.clone())
            .with_query(query.as_deref().unwrap_or(""))
            .with_body(body.clone());
        ctx.headers = collect_headers(&parts.headers);

        let verdict = self.pipeline.evaluate(&ctx).await;
        let latency_us = start.elapsed().as_micros() as u64;

        let (response, outcome) = match &verdict {
            Verdict::Allow { event, failed_open } => {
                let outcome = if *failed_open {
                    Outcome::FailedOpen
                } else if event.is_some() {
                    Outcome::Monitored
                } else {
                    Outcome::Allowed
                };
                let mut response = self
                    .forward_to_backend(&parts.method, &path, query.as_deref(), &parts.headers, body, &ip)
                    .await;
                apply_security_headers(response.headers_mut());
                (response, outcome)
            }
            Verdict::Block { body, .. } => (
                canned(StatusCode::FORBIDDEN, "application/json", body.clone()),
                Outcome::Blocked,
            ),
            Verdict::Challenge { page, .. } => (
                canned(StatusCode::TOO_MANY_REQUESTS, "text/html; charset=utf-8", page.clone()),
                Outcome::Challenged,
            ),
        };

        self.metrics.record_request(&ip, outcome, latency_us);

        if let Some(ref logger) = self.access_log {
            logger.log(&AccessEntry {
                ts: access_log::timestamp(),
                ip: &ip,
                method: parts.method.as_str(),
                path: &path,
                status: response.status().as_u16(),
                outcome: outcome.as_str(),
                us: start.elapsed().as_micros() as u64,
                ua: ctx.user_agent().unwrap_or(""),
                event: verdict.event().map(|e| e.id()),
            });
        }

        response
    }

    // -----------------------------------------------------------------------
    // Challenge verification
    // -----------------------------------------------------------------------

    fn handle_challenge_verification(&self, method: &Method, body: &Bytes, ip: &str) -> Response<Full<Bytes>> {
        if method != Method::POST {
            return canned(
                StatusCode::METHOD_NOT_ALLOWED,
                "application/json",
                r#"{"success":false}"#,
            );
        }

        let request: VerifyRequest = match serde_json::from_slice(body) {
            Ok(r) => r,
            Err(e) => {
                warn!(client_ip = %ip, error = %e, "Challenge verification: malformed body");
                return verification_failed("malformed");
            }
        };

        match self.pipeline.challenge().verify(&request.challenge_id, ip) {
            VerifyOutcome::Cleared(cookie) => {
                info!(client_ip = %ip, "Challenge verified, clearance cookie issued");
                let mut response = canned(StatusCode::OK, "application/json", r#"{"success":true}"#);
                match HeaderValue::from_str(&cookie) {
                    Ok(value) => {
                        response.headers_mut().insert(SET_COOKIE, value);
                    }
                    Err(e) => error!(error = %e, "Clearance cookie is not a valid header value"),
                }
                response
            }
            VerifyOutcome::Unknown => verification_failed("unknown"),
            VerifyOutcome::Expired => verification_failed("expired"),
            VerifyOutcome::IpMismatch => verification_failed("ip_mismatch"),
        }
    }

    // -----------------------------------------------------------------------
    // Backend forwarding (connection-pooled via hyper client)
    // -----------------------------------------------------------------------

    async fn forward_to_backend(
        &self,
        method: &Method,
        path: &str,
        query: Option<&str>,
        headers: &HeaderMap,
        body: Bytes,
        client_ip: &str,
    ) -> Response<Full<Bytes>> {
        let uri = match query {
            Some(q) => format!("http://{}{}?{}", self.upstream_address, path, q),
            None => format!("http://{}{}", self.upstream_address, path),
        };

        let mut builder = Request::builder().method(method.clone()).uri(&uri);
        for (name, value) in headers {
            let lower = name.as_str();
            if HOP_BY_HOP.contains(&lower) || lower == "x-forwarded-for" || lower == "x-real-ip" {
                continue;
            }
            builder = builder.header(name, value);
        }
        if let Some(host) = headers.get(http::header::HOST) {
            builder = builder.header(http::header::HOST, host);
        }
        builder = builder
            .header("x-forwarded-for", client_ip)
            .header("x-real-ip", client_ip);

        let upstream_req = match builder.body(Full::new(body)) {
            Ok(r) => r,
            Err(err) => {
                error!(error = %err, "Failed to build upstream request");
                return bad_gateway();
            }
        };

        let upstream_resp =
            match tokio::time::timeout(self.response_timeout, self.upstream_client.request(upstream_req)).await {
                Ok(Ok(r)) => r,
                Ok(Err(err)) => {
                    error!(upstream = %self.upstream_address, error = %err, "Backend request failed");
                    return bad_gateway();
                }
                Err(_) => {
                    error!(
                        upstream = %self.upstream_address,
                        timeout_ms = self.response_timeout.as_millis() as u64,
                        "Backend request timed out"
                    );
                    return gateway_timeout();
                }
            };

        let (mut parts, incoming_body) = upstream_resp.into_parts();
        let body_bytes = match incoming_body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(err) => {
                error!(error = %err, "Failed to read backend response body");
                return bad_gateway();
            }
        };
        for name in HOP_BY_HOP {
            parts.headers.remove(*name);
        }

        Response::from_parts(parts, Full::new(body_bytes))
    }
}

// ---------------------------------------------------------------------------
// Canned responses
// ---------------------------------------------------------------------------

fn canned(status: StatusCode, content_type: &'static str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
}

fn verification_failed(reason: &str) -> Response<Full<Bytes>> {
    canned(
        StatusCode::FORBIDDEN,
        "application/json",
        format!(r#"{{"success":false,"reason":"{}"}}"#, reason),
    )
}

pub fn bad_gateway() -> Response<Full<Bytes>> {
    canned(StatusCode::BAD_GATEWAY, "text/plain; charset=utf-8", "Bad Gateway")
}

fn gateway_timeout() -> Response<Full<Bytes>> {
    canned(StatusCode::GATEWAY_TIMEOUT, "text/plain; charset=utf-8", "Gateway Timeout")
}

fn payload_too_large() -> Response<Full<Bytes>> {
    canned(StatusCode::PAYLOAD_TOO_LARGE, "text/plain; charset=utf-8", "Payload Too Large")
}

fn apply_security_headers(headers: &mut HeaderMap) {
    for &(name, value) in SECURITY_HEADERS {
        headers.insert(HeaderName::from_static(name), HeaderValue::from_static(value));
    }
}

// ---------------------------------------------------------------------------
// Utilities
// ---------------------------------------------------------------------------

/// Resolve the client address: `CF-Connecting-IP`, then the first
/// `X-Forwarded-For` entry, then `X-Real-IP`, then the socket peer.
pub fn client_ip(headers: &HeaderMap, peer: Option<IpAddr>) -> String {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    if let Some(ip) = header("cf-connecting-ip") {
        return ip.to_string();
    }
    if let Some(first) = header("x-forwarded-for")
        .and_then(|xff| xff.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return first.to_string();
    }
    if let Some(ip) = header("x-real-ip") {
        return ip.to_string();
    }
    match peer {
        Some(addr) => addr.to_string(),
        None => "unknown".to_string(),
    }
}

/// Lower-cased header map for the pipeline. Repeated headers are joined,
/// cookies with `; ` and everything else with `, `.
fn collect_headers(headers: &HeaderMap) -> HashMap<String, String> {
    let mut out: HashMap<String, String> = HashMap::new();
    for (name, value) in headers {
        // Non-UTF-8 bytes are replaced, not dropped, so they are still scanned.
        let value = String::from_utf8_lossy(value.as_bytes());
        let separator = if name == http::header::COOKIE { "; " } else { ", " };
        match out.entry(name.as_str().to_string()) {
            Entry::Occupied(mut entry) => {
                let existing = entry.get_mut();
                existing.push_str(separator);
                existing.push_str(&value);
            }
            Entry::Vacant(entry) => {
                entry.insert(value.into_owned());
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;

    use crate::models::threat::ResponseAction;
    use crate::storage::memory::MemoryReputationStore;

    const BROWSER_UA: &str = "Mozilla/5.0 (X11; Linux x86_64; rv:126.0) Gecko/20100101 Firefox/126.0";

    async fn spawn_upstream() -> String {
        let app = Router::new().fallback(|| async { "upstream ok" });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr.to_string()
    }

    async fn handler(action: ResponseAction) -> (HttpHandler, Arc<MetricsCollector>) {
        let mut settings = Settings::default();
        settings.upstream.address = spawn_upstream().await;
        settings.logging.access_log = String::new();
        settings.protection.response_action = action;
        settings.challenge.hmac_secret = "handler-test".into();
        let pipeline = Arc::new(
            ProtectionPipeline::new(&settings, Arc::new(MemoryReputationStore::new())).unwrap(),
        );
        let metrics = Arc::new(MetricsCollector::new());
        (HttpHandler::new(pipeline, Arc::clone(&metrics), &settings), metrics)
    }

    fn browser_request(uri: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .uri(uri)
            .header("user-agent", BROWSER_UA)
            .header("accept", "text/html")
            .header("accept-language", "en-US")
            .header("accept-encoding", "gzip")
            .body(Full::new(Bytes::new()))
            .unwrap()
    }

    fn scanner_request() -> Request<Full<Bytes>> {
        Request::builder()
            .uri("/")
            .header("user-agent", "sqlmap/1.0")
            .body(Full::new(Bytes::new()))
            .unwrap()
    }

    async fn body_string(response: Response<Full<Bytes>>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn peer() -> Option<IpAddr> {
        Some("203.0.113.9".parse().unwrap())
    }

    #[test]
    fn test_client_ip_precedence() {
        let mut headers = HeaderMap::new();
        assert_eq!(client_ip(&headers, None), "unknown");
        assert_eq!(client_ip(&headers, Some("10.0.0.1".parse().unwrap())), "10.0.0.1");

        headers.insert("x-real-ip", HeaderValue::from_static(" 5.5.5.5 "));
        assert_eq!(client_ip(&headers, Some("10.0.0.1".parse().unwrap())), "5.5.5.5");

        headers.insert("x-forwarded-for", HeaderValue::from_static(" 4.4.4.4 , 10.0.0.2"));
        assert_eq!(client_ip(&headers, None), "4.4.4.4");

        headers.insert("cf-connecting-ip", HeaderValue::from_static("3.3.3.3"));
        assert_eq!(client_ip(&headers, None), "3.3.3.3");
    }

    #[test]
    fn test_repeated_headers_are_joined() {
        let mut headers = HeaderMap::new();
        headers.append("cookie", HeaderValue::from_static("a=1"));
        headers.append("cookie", HeaderValue::from_static("b=2"));
        headers.append("accept", HeaderValue::from_static("text/html"));
        let map = collect_headers(&headers);
        assert_eq!(map["cookie"], "a=1; b=2");
        assert_eq!(map["accept"], "text/html");
    }

    #[test]
    fn test_non_utf8_header_values_are_kept() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-note",
            HeaderValue::from_bytes(b"<script>alert(1)</script>\xff").unwrap(),
        );
        let map = collect_headers(&headers);
        assert_eq!(map["x-note"], "<script>alert(1)</script>\u{FFFD}");
    }

    #[tokio::test]
    async fn test_script_in_non_utf8_header_is_blocked() {
        let (handler, metrics) = handler(ResponseAction::Block).await;
        let mut request = browser_request("/");
        request.headers_mut().insert(
            "x-note",
            HeaderValue::from_bytes(b"<script>alert(1)</script>\xff").unwrap(),
        );
        let response = handler.handle(request, peer()).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let event = handler.pipeline.events().recent(1).pop().unwrap();
        assert_eq!(event.details()["source"], "payload");
        assert_eq!(metrics.snapshot().blocked, 1);
    }

    #[tokio::test]
    async fn test_allowed_request_is_forwarded_with_security_headers() {
        let (handler, metrics) = handler(ResponseAction::Block).await;
        let response = handler.handle(browser_request("/hello?x=1"), peer()).await;
        assert_eq!(response.status(), StatusCode::OK);
        for (name, value) in SECURITY_HEADERS {
            assert_eq!(response.headers()[*name], *value);
        }
        assert_eq!(body_string(response).await, "upstream ok");
        assert_eq!(metrics.snapshot().allowed, 1);
    }

    #[tokio::test]
    async fn test_blocked_request_gets_json_403() {
        let (handler, metrics) = handler(ResponseAction::Block).await;
        let response = handler.handle(scanner_request(), peer()).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(response.headers()[CONTENT_TYPE], "application/json");
        let body: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert!(body["eventId"].is_string());
        assert_eq!(metrics.snapshot().blocked, 1);
    }

    #[tokio::test]
    async fn test_challenge_then_verify_then_clearance() {
        let (handler, metrics) = handler(ResponseAction::Challenge).await;
        let response = handler.handle(scanner_request(), peer()).await;
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let page = body_string(response).await;

        let marker = "Reference: ";
        let start = page.find(marker).unwrap() + marker.len();
        let challenge_id = page[start..start + 32].to_string();
        assert_eq!(handler.pipeline.challenge().pending_count(), 1);

        let verify = Request::builder()
            .method(Method::POST)
            .uri("/__shieldwall/challenge/verify")
            .header("content-type", "application/json")
            .body(Full::new(Bytes::from(format!(r#"{{"challengeId":"{}"}}"#, challenge_id))))
            .unwrap();
        let response = handler.handle(verify, peer()).await;
        assert_eq!(response.status(), StatusCode::OK);
        let cookie = response.headers()[SET_COOKIE].to_str().unwrap().to_string();
        let cookie_pair = cookie.split(';').next().unwrap().to_string();

        let cleared = Request::builder()
            .uri("/")
            .header("user-agent", "sqlmap/1.0")
            .header("cookie", cookie_pair)
            .body(Full::new(Bytes::new()))
            .unwrap();
        let response = handler.handle(cleared, peer()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(metrics.snapshot().challenged, 1);
        assert_eq!(metrics.snapshot().monitored, 1);
    }

    #[tokio::test]
    async fn test_verify_rejects_unknown_id_and_wrong_method() {
        let (handler, _) = handler(ResponseAction::Challenge).await;
        let unknown = Request::builder()
            .method(Method::POST)
            .uri("/__shieldwall/challenge/verify")
            .body(Full::new(Bytes::from(r#"{"challengeId":"nope"}"#)))
            .unwrap();
        assert_eq!(handler.handle(unknown, peer()).await.status(), StatusCode::FORBIDDEN);

        let get = Request::builder()
            .uri("/__shieldwall/challenge/verify")
            .body(Full::new(Bytes::new()))
            .unwrap();
        assert_eq!(
            handler.handle(get, peer()).await.status(),
            StatusCode::METHOD_NOT_ALLOWED
        );
    }

    #[tokio::test]
    async fn test_unreachable_upstream_is_bad_gateway() {
        let mut settings = Settings::default();
        settings.upstream.address = "127.0.0.1:1".into();
        settings.logging.access_log = String::new();
        let pipeline = Arc::new(
            ProtectionPipeline::new(&settings, Arc::new(MemoryReputationStore::new())).unwrap(),
        );
        let handler = HttpHandler::new(pipeline, Arc::new(MetricsCollector::new()), &settings);
        let response = handler.handle(browser_request("/"), peer()).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_oversized_body_is_rejected() {
        let mut settings = Settings::default();
        settings.server.max_body_bytes = 8;
        settings.logging.access_log = String::new();
        let pipeline = Arc::new(
            ProtectionPipeline::new(&settings, Arc::new(MemoryReputationStore::new())).unwrap(),
        );
        let handler = HttpHandler::new(pipeline, Arc::new(MetricsCollector::new()), &settings);
        let request = Request::builder()
            .method(Method::POST)
            .uri("/upload")
            .body(Full::new(Bytes::from(vec![b'x'; 64])))
            .unwrap();
        assert_eq!(
            handler.handle(request, peer()).await.status(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
    }
}
