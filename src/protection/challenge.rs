use std::time::{Duration, Instant};

use base64::Engine;
use chrono::Utc;
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::config::settings::ChallengeConfig;

type HmacSha256 = Hmac<Sha256>;

const CLEARANCE_PURPOSE: &str = "clearance";

#[derive(Debug, Clone)]
struct PendingChallenge {
    ip: String,
    issued_at: Instant,
}

/// Outcome of posting a challenge id to the verification endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// Carries the full `Set-Cookie` header value.
    Cleared(String),
    Unknown,
    Expired,
    IpMismatch,
}

/// Interactive challenge flow.
///
/// 1. A challenged request gets a 429 page carrying a one-time challenge id.
/// 2. After a short delay the page POSTs the id to the verification path.
/// 3. A valid id is exchanged for a signed clearance cookie bound to the IP.
/// 4. The page reloads and the cookie lets the request through.
pub struct ChallengeSystem {
    pending: DashMap<String, PendingChallenge>,
    /// Outstanding challenge id per IP.
    by_ip: DashMap<String, String>,
    hmac_secret: Vec<u8>,
    cookie_name: String,
    cookie_max_age: Duration,
    challenge_ttl: Duration,
    verify_path: String,
    delay_ms: u64,
}

impl ChallengeSystem {
    pub fn new(config: &ChallengeConfig) -> Self {
        let hmac_secret = if config.hmac_secret.is_empty() {
            warn!("challenge.hmac_secret not set; clearance cookies will not survive a restart");
            let mut rng = rand::rng();
            (0..32).map(|_| rng.random::<u8>()).collect()
        } else {
            config.hmac_secret.as_bytes().to_vec()
        };
        info!(verify_path = %config.verify_path, "Challenge system initialized");
        Self {
            pending: DashMap::new(),
            by_ip: DashMap::new(),
            hmac_secret,
            cookie_name: config.cookie_name.clone(),
            cookie_max_age: Duration::from_secs(config.cookie_max_age_secs),
            challenge_ttl: Duration::from_secs(config.challenge_ttl_secs),
            verify_path: config.verify_path.clone(),
            delay_ms: config.delay_ms,
        }
    }

    pub fn verify_path(&self) -> &str {
        &self.verify_path
    }

    /// Challenge id for `ip`. An IP holds at most one outstanding id, which
    /// is handed out again until it is redeemed or expires.
    pub fn issue(&self, ip: &str) -> String {
        let mut slot = self.by_ip.entry(ip.to_string()).or_default();
        if let Some(pending) = self.pending.get(slot.as_str()) {
            if pending.issued_at.elapsed() <= self.challenge_ttl {
                return slot.clone();
            }
        }
        self.pending.remove(slot.as_str());

        let id = generate_random_hex(32);
        self.pending.insert(
            id.clone(),
            PendingChallenge {
                ip: ip.to_string(),
                issued_at: Instant::now(),
            },
        );
        *slot = id.clone();
        id
    }

    /// HTML body for the 429 challenge response.
    pub fn render_page(&self, challenge_id: &str) -> String {
        CHALLENGE_HTML_TEMPLATE
            .replace("__CHALLENGE_ID__", challenge_id)
            .replace("__VERIFY_PATH__", &self.verify_path)
            .replace("__DELAY_MS__", &self.delay_ms.to_string())
    }

    /// Consume a challenge id. Each id can be redeemed once.
    pub fn verify(&self, challenge_id: &str, ip: &str) -> VerifyOutcome {
        let pending = match self.pending.remove(challenge_id) {
            Some((_, pending)) => pending,
            None => return VerifyOutcome::Unknown,
        };
        self.by_ip.remove_if(&pending.ip, |_, id| id == challenge_id);
        if pending.issued_at.elapsed() > self.challenge_ttl {
            debug!(ip = %ip, "Challenge expired before verification");
            return VerifyOutcome::Expired;
        }
        if pending.ip != ip {
            debug!(ip = %ip, issued_to = %pending.ip, "Challenge redeemed from a different IP");
            return VerifyOutcome::IpMismatch;
        }
        debug!(ip = %ip, "Challenge passed, issuing clearance");
        VerifyOutcome::Cleared(self.generate_clearance_cookie(ip))
    }

    /// Signed clearance cookie bound to `ip`.
    ///
    /// Value format: `timestamp:random_hex:ip_hash:signature`, where the
    /// signature is base64url(HMAC-SHA256(timestamp:random_hex:ip_hash)).
    pub fn generate_clearance_cookie(&self, ip: &str) -> String {
        let timestamp = Utc::now().timestamp();
        let payload = format!("{}:{}:{}", timestamp, generate_random_hex(16), self.hash_ip(ip));
        let signature = self.compute_signature(&payload);
        format!(
            "{}={}:{}; Path=/; Max-Age={}; SameSite=Lax; HttpOnly",
            self.cookie_name,
            payload,
            signature,
            self.cookie_max_age.as_secs()
        )
    }

    /// Whether the `Cookie` header carries an unexpired clearance for `ip`.
    pub fn has_valid_clearance(&self, ip: &str, cookies: Option<&str>) -> bool {
        let Some(value) = cookies.and_then(|c| self.extract_cookie(c)) else {
            return false;
        };

        let parts: Vec<&str> = value.splitn(4, ':').collect();
        if parts.len() != 4 {
            debug!("Invalid clearance cookie format");
            return false;
        }
        let payload = format!("{}:{}:{}", parts[0], parts[1], parts[2]);
        if !self.verify_signature(&payload, parts[3]) {
            debug!("Invalid clearance cookie: signature mismatch");
            return false;
        }

        let Ok(timestamp) = parts[0].parse::<i64>() else {
            return false;
        };
        let age = Utc::now().timestamp() - timestamp;
        if age < 0 || age > self.cookie_max_age.as_secs() as i64 {
            debug!(age = age, "Clearance cookie expired");
            return false;
        }

        if parts[2] != self.hash_ip(ip) {
            debug!(ip = %ip, "Clearance cookie bound to another IP");
            return false;
        }
        true
    }

    /// Drop challenges that can no longer be redeemed.
    pub fn cleanup(&self) -> usize {
        let expired: Vec<String> = self
            .pending
            .iter()
            .filter(|entry| entry.issued_at.elapsed() > self.challenge_ttl)
            .map(|entry| entry.key().clone())
            .collect();
        let count = expired.len();
        for id in expired {
            self.pending.remove(&id);
        }
        self.by_ip.retain(|_, id| self.pending.contains_key(id.as_str()));
        count
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn extract_cookie<'a>(&self, cookies: &'a str) -> Option<&'a str> {
        let prefix = format!("{}=", self.cookie_name);
        cookies
            .split(';')
            .map(str::trim)
            .find_map(|cookie| cookie.strip_prefix(prefix.as_str()))
    }

    fn mac(&self, payload: &str) -> HmacSha256 {
        let mut mac = HmacSha256::new_from_slice(&self.hmac_secret)
            .expect("HMAC can take key of any size");
        mac.update(payload.as_bytes());
        mac.update(b":");
        mac.update(CLEARANCE_PURPOSE.as_bytes());
        mac
    }

    fn compute_signature(&self, payload: &str) -> String {
        let result = self.mac(payload).finalize().into_bytes();
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(result)
    }

    fn verify_signature(&self, payload: &str, signature: &str) -> bool {
        match base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(signature) {
            Ok(bytes) => self.mac(payload).verify_slice(&bytes).is_ok(),
            Err(_) => false,
        }
    }

    /// First 8 hex chars of SHA-256(ip + secret).
    fn hash_ip(&self, ip: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(ip.as_bytes());
        hasher.update(&self.hmac_secret);
        hex::encode(&hasher.finalize()[..4])
    }
}

fn generate_random_hex(len: usize) -> String {
    let mut rng = rand::rng();
    let bytes: Vec<u8> = (0..len / 2).map(|_| rng.random()).collect();
    hex::encode(&bytes)
}

mod hex {
    pub fn encode(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

/// Placeholders: `__CHALLENGE_ID__`, `__VERIFY_PATH__`, `__DELAY_MS__`.
const CHALLENGE_HTML_TEMPLATE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width,initial-scale=1">
<meta name="robots" content="noindex,nofollow">
<title>Checking your browser</title>
<style>
body { background: #f4f5f7; color: #1f2933; font-family: -apple-system, system-ui, sans-serif; display: flex; justify-content: center; align-items: center; min-height: 100vh; margin: 0; }
.box { text-align: center; max-width: 420px; padding: 2rem; background: #fff; border-radius: 8px; box-shadow: 0 1px 4px rgba(0,0,0,.08); }
.spinner { width: 36px; height: 36px; border: 3px solid #d9e2ec; border-top-color: #2f80ed; border-radius: 50%; animation: spin .8s linear infinite; margin: 1rem auto; }
@keyframes spin { to { transform: rotate(360deg); } }
small { color: #829ab1; }
</style>
</head>
<body>
<div class="box">
<h2>Checking your browser</h2>
<p>This page will reload automatically in a few seconds.</p>
<div class="spinner"></div>
<p id="status"></p>
<small>Reference: __CHALLENGE_ID__</small>
<noscript><p>Please enable JavaScript to continue.</p></noscript>
</div>
<script>
(function() {
  var statusEl = document.getElementById("status");
  setTimeout(function() {
    fetch("__VERIFY_PATH__", {
      method: "POST",
      credentials: "same-origin",
      headers: { "Content-Type": "application/json" },
      body: JSON.stringify({ challengeId: "__CHALLENGE_ID__" })
    }).then(function(res) {
      if (res.ok) { window.location.reload(); }
      else { statusEl.textContent = "Verification failed. Please refresh the page."; }
    }).catch(function() {
      statusEl.textContent = "Verification failed. Please refresh the page.";
    });
  }, __DELAY_MS__);
})();
</script>
</body>
</html>"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::defaults;

    fn system() -> ChallengeSystem {
        let mut config = defaults::default_challenge_config();
        config.hmac_secret = "test-secret".into();
        ChallengeSystem::new(&config)
    }

    fn cookie_pair(set_cookie: &str) -> String {
        set_cookie.split(';').next().unwrap().to_string()
    }

    #[test]
    fn test_page_embeds_id_and_endpoint() {
        let system = system();
        let id = system.issue("1.2.3.4");
        assert_eq!(id.len(), 32);
        let page = system.render_page(&id);
        assert!(page.contains(&id));
        assert!(page.contains("/__shieldwall/challenge/verify"));
        assert!(page.contains("3000"));
        assert!(!page.contains("__CHALLENGE_ID__"));
    }

    #[test]
    fn test_verify_issues_cookie_once() {
        let system = system();
        let id = system.issue("1.2.3.4");
        let cookie = match system.verify(&id, "1.2.3.4") {
            VerifyOutcome::Cleared(cookie) => cookie,
            other => panic!("unexpected outcome {:?}", other),
        };
        assert!(cookie.starts_with("__shieldwall_clearance="));
        assert!(cookie.contains("HttpOnly"));
        assert_eq!(system.verify(&id, "1.2.3.4"), VerifyOutcome::Unknown);
        assert_eq!(system.pending_count(), 0);

        let header = format!("theme=dark; {}", cookie_pair(&cookie));
        assert!(system.has_valid_clearance("1.2.3.4", Some(&header)));
        assert!(!system.has_valid_clearance("5.6.7.8", Some(&header)));
    }

    #[test]
    fn test_repeat_challenges_reuse_outstanding_id() {
        let system = system();
        let first = system.issue("1.2.3.4");
        for _ in 0..50 {
            assert_eq!(system.issue("1.2.3.4"), first);
        }
        let other = system.issue("5.6.7.8");
        assert_ne!(other, first);
        assert_eq!(system.pending_count(), 2);

        assert!(matches!(system.verify(&first, "1.2.3.4"), VerifyOutcome::Cleared(_)));
        let next = system.issue("1.2.3.4");
        assert_ne!(next, first);
        assert_eq!(system.pending_count(), 2);
    }

    #[test]
    fn test_expired_challenge_is_replaced() {
        let mut config = defaults::default_challenge_config();
        config.hmac_secret = "test-secret".into();
        config.challenge_ttl_secs = 0;
        let system = ChallengeSystem::new(&config);
        let first = system.issue("1.2.3.4");
        std::thread::sleep(Duration::from_millis(5));
        let second = system.issue("1.2.3.4");
        assert_ne!(first, second);
        assert_eq!(system.pending_count(), 1);
        assert_eq!(system.verify(&first, "1.2.3.4"), VerifyOutcome::Unknown);
    }

    #[test]
    fn test_verify_rejects_other_ip() {
        let system = system();
        let id = system.issue("1.2.3.4");
        assert_eq!(system.verify(&id, "9.9.9.9"), VerifyOutcome::IpMismatch);
    }

    #[test]
    fn test_tampered_cookie_is_rejected() {
        let system = system();
        let cookie = cookie_pair(&system.generate_clearance_cookie("1.2.3.4"));
        let (name, value) = cookie.split_once('=').unwrap();
        let mut parts: Vec<&str> = value.split(':').collect();
        parts[0] = "9999999999";
        let forged = format!("{}={}", name, parts.join(":"));
        assert!(!system.has_valid_clearance("1.2.3.4", Some(&forged)));
        assert!(!system.has_valid_clearance("1.2.3.4", None));
        assert!(!system.has_valid_clearance("1.2.3.4", Some("__shieldwall_clearance=garbage")));
    }

    #[test]
    fn test_cookie_from_other_secret_is_rejected() {
        let other = {
            let mut config = defaults::default_challenge_config();
            config.hmac_secret = "another-secret".into();
            ChallengeSystem::new(&config)
        };
        let cookie = cookie_pair(&other.generate_clearance_cookie("1.2.3.4"));
        assert!(!system().has_valid_clearance("1.2.3.4", Some(&cookie)));
    }
}
