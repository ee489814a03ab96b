use tracing::debug;

use super::patterns::PatternLibrary;
use crate::models::request::RequestContext;

const MALICIOUS_TOOL_SCORE: u32 = 50;
const MISSING_ACCEPT_SCORE: u32 = 15;
const MISSING_ACCEPT_LANGUAGE_SCORE: u32 = 10;
const MISSING_ACCEPT_ENCODING_SCORE: u32 = 10;
const QUERY_HEAVY_GET_SCORE: u32 = 15;
const AJAX_WITHOUT_REFERER_SCORE: u32 = 20;
const ODD_UA_LENGTH_SCORE: u32 = 25;

const MAX_GET_QUERY_PARAMS: usize = 10;
const MIN_UA_LEN: usize = 10;
const MAX_UA_LEN: usize = 500;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BotDetection {
    pub is_bot: bool,
    pub is_malicious: bool,
    pub score: u32,
    pub reasons: Vec<String>,
    pub signature: Option<String>,
}

/// Additive header and user-agent heuristics.
pub struct BotDetector {
    block_threshold: u32,
    classification_threshold: u32,
}

impl BotDetector {
    pub fn new(block_threshold: u32, classification_threshold: u32) -> Self {
        Self {
            block_threshold,
            classification_threshold,
        }
    }

    pub fn detect(&self, ctx: &RequestContext, patterns: &PatternLibrary) -> BotDetection {
        let mut detection = BotDetection::default();
        let ua = ctx.user_agent().unwrap_or("");

        if let Some(rule) = patterns.first_bot_match(ua) {
            detection.score += rule.weight;
            detection.signature = Some(rule.id.clone());
            detection.reasons.push(format!("signature:{}", rule.id));
            if rule.malicious {
                detection.score += MALICIOUS_TOOL_SCORE;
                detection.is_malicious = true;
                detection.reasons.push(format!("malicious_tool:{}", rule.category));
            }
        }

        if !ctx.has_header("accept") {
            detection.score += MISSING_ACCEPT_SCORE;
            detection.reasons.push("missing_accept".into());
        }
        if !ctx.has_header("accept-language") {
            detection.score += MISSING_ACCEPT_LANGUAGE_SCORE;
            detection.reasons.push("missing_accept_language".into());
        }
        if !ctx.has_header("accept-encoding") {
            detection.score += MISSING_ACCEPT_ENCODING_SCORE;
            detection.reasons.push("missing_accept_encoding".into());
        }

        if ctx.method == "GET" && ctx.query_param_count() > MAX_GET_QUERY_PARAMS {
            detection.score += QUERY_HEAVY_GET_SCORE;
            detection.reasons.push("excessive_query_params".into());
        }

        if ctx.has_header("x-requested-with") && !ctx.has_header("referer") {
            detection.score += AJAX_WITHOUT_REFERER_SCORE;
            detection.reasons.push("xhr_without_referer".into());
        }

        let ua_len = ua.chars().count();
        if ua_len < MIN_UA_LEN || ua_len > MAX_UA_LEN {
            detection.score += ODD_UA_LENGTH_SCORE;
            detection.reasons.push("unusual_user_agent_length".into());
        }

        detection.is_bot =
            detection.signature.is_some() || detection.score >= self.classification_threshold;

        if detection.is_bot {
            debug!(
                ip = %ctx.client_ip,
                score = detection.score,
                malicious = detection.is_malicious,
                reasons = ?detection.reasons,
                "Bot characteristics detected"
            );
        }
        detection
    }

    /// Whether a detection is strong enough to stop the request.
    pub fn should_block(&self, detection: &BotDetection) -> bool {
        detection.is_bot && detection.score >= self.block_threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BROWSER_UA: &str =
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

    fn browser(ip: &str) -> RequestContext {
        RequestContext::new(ip, "GET", "/")
            .with_header("User-Agent", BROWSER_UA)
            .with_header("Accept", "text/html")
            .with_header("Accept-Language", "en-US,en;q=0.9")
            .with_header("Accept-Encoding", "gzip, br")
    }

    #[test]
    fn test_browser_scores_zero() {
        let patterns = PatternLibrary::builtin().unwrap();
        let detector = BotDetector::new(70, 70);
        let detection = detector.detect(&browser("1.2.3.4"), &patterns);
        assert_eq!(detection.score, 0);
        assert!(!detection.is_bot);
        assert!(!detector.should_block(&detection));
    }

    #[test]
    fn test_sqlmap_is_malicious_bot() {
        let patterns = PatternLibrary::builtin().unwrap();
        let detector = BotDetector::new(70, 70);
        let ctx = RequestContext::new("1.2.3.4", "GET", "/").with_header("User-Agent", "sqlmap/1.0");
        let detection = detector.detect(&ctx, &patterns);
        assert!(detection.is_bot);
        assert!(detection.is_malicious);
        assert!(detection.score >= 50);
        assert_eq!(detection.signature.as_deref(), Some("scanner.sqlmap"));
        assert!(detector.should_block(&detection));
    }

    #[test]
    fn test_crawler_with_full_headers_is_bot_but_not_blocked() {
        let patterns = PatternLibrary::builtin().unwrap();
        let detector = BotDetector::new(70, 70);
        let ctx = browser("66.249.66.1")
            .with_header("User-Agent", "Mozilla/5.0 (compatible; Googlebot/2.1; +http://www.google.com/bot.html)");
        let detection = detector.detect(&ctx, &patterns);
        assert!(detection.is_bot);
        assert!(!detection.is_malicious);
        assert_eq!(detection.score, 20);
        assert!(!detector.should_block(&detection));
    }

    #[test]
    fn test_header_heuristics_accumulate() {
        let patterns = PatternLibrary::builtin().unwrap();
        let detector = BotDetector::new(70, 70);
        let query: Vec<String> = (0..11).map(|i| format!("p{}=1", i)).collect();
        let ctx = RequestContext::new("1.2.3.4", "GET", "/")
            .with_query(&query.join("&"))
            .with_header("User-Agent", BROWSER_UA)
            .with_header("X-Requested-With", "XMLHttpRequest");
        let detection = detector.detect(&ctx, &patterns);
        // missing accept (15) + language (10) + encoding (10) + query (15) + xhr (20)
        assert_eq!(detection.score, 70);
        assert!(detection.is_bot);
        assert!(detection.signature.is_none());
    }

    #[test]
    fn test_suspicious_ua_threshold_classifies_earlier() {
        let patterns = PatternLibrary::builtin().unwrap();
        let detector = BotDetector::new(70, 30);
        let ctx = RequestContext::new("1.2.3.4", "GET", "/").with_header("User-Agent", BROWSER_UA);
        let detection = detector.detect(&ctx, &patterns);
        assert_eq!(detection.score, 35);
        assert!(detection.is_bot);
        assert!(!detector.should_block(&detection));
    }
}
