use std::collections::HashSet;
use std::fs;

use regex::Regex;
use serde::Deserialize;
use tracing::info;

use crate::error::{WafError, WafResult};

/// Version string of the compiled-in rule table.
pub const BUILTIN_VERSION: &str = "builtin-1";

/// One rule as written in a rules file.
#[derive(Debug, Clone, Deserialize)]
pub struct RuleSpec {
    pub id: String,
    pub pattern: String,
    pub category: String,
    #[serde(default = "default_weight")]
    pub weight: i64,
    /// Only meaningful for bot signatures: marks offensive tooling.
    #[serde(default)]
    pub malicious: bool,
}

fn default_weight() -> i64 {
    20
}

/// On-disk rule table.
///
/// ```toml
/// version = "2024-06-01"
///
/// [[bot]]
/// id = "scanner.sqlmap"
/// pattern = "(?i)sqlmap"
/// category = "scanner"
/// malicious = true
///
/// [[payload]]
/// id = "sqli.union"
/// pattern = "(?i)\\bunion\\b.*\\bselect\\b"
/// category = "sql_injection"
/// weight = 40
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct RuleFile {
    pub version: String,
    #[serde(default)]
    pub bot: Vec<RuleSpec>,
    #[serde(default)]
    pub payload: Vec<RuleSpec>,
}

#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub id: String,
    pub category: String,
    pub weight: u32,
    pub malicious: bool,
    regex: Regex,
}

impl CompiledRule {
    fn compile(spec: &RuleSpec) -> WafResult<Self> {
        if spec.id.trim().is_empty() {
            return Err(WafError::validation("<empty>", "rule id must not be empty"));
        }
        if spec.weight <= 0 {
            return Err(WafError::validation(
                &spec.id,
                format!("weight must be positive, got {}", spec.weight),
            ));
        }
        let weight = u32::try_from(spec.weight)
            .map_err(|_| WafError::validation(&spec.id, "weight out of range"))?;
        let regex = Regex::new(&spec.pattern)
            .map_err(|e| WafError::validation(&spec.id, format!("invalid pattern: {}", e)))?;
        Ok(Self {
            id: spec.id.clone(),
            category: spec.category.clone(),
            weight,
            malicious: spec.malicious,
            regex,
        })
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.regex.is_match(text)
    }
}

/// Compiled bot and payload signature tables.
///
/// Immutable once built; the pipeline swaps whole libraries on reload.
#[derive(Debug, Clone)]
pub struct PatternLibrary {
    version: String,
    bot: Vec<CompiledRule>,
    payload: Vec<CompiledRule>,
}

impl PatternLibrary {
    /// The compiled-in signature set.
    pub fn builtin() -> WafResult<Self> {
        let file = RuleFile {
            version: BUILTIN_VERSION.to_string(),
            bot: BUILTIN_BOT
                .iter()
                .map(|(id, pattern, category, malicious)| RuleSpec {
                    id: id.to_string(),
                    pattern: pattern.to_string(),
                    category: category.to_string(),
                    weight: 20,
                    malicious: *malicious,
                })
                .collect(),
            payload: BUILTIN_PAYLOAD
                .iter()
                .map(|(id, pattern, category)| RuleSpec {
                    id: id.to_string(),
                    pattern: pattern.to_string(),
                    category: category.to_string(),
                    weight: 40,
                    malicious: false,
                })
                .collect(),
        };
        Self::from_rule_file(&file)
    }

    pub fn from_rule_file(file: &RuleFile) -> WafResult<Self> {
        if file.version.trim().is_empty() {
            return Err(WafError::validation("version", "rule table version must not be empty"));
        }

        let mut seen = HashSet::new();
        for spec in file.bot.iter().chain(file.payload.iter()) {
            if !spec.id.is_empty() && !seen.insert(spec.id.as_str()) {
                return Err(WafError::validation(&spec.id, "duplicate rule id"));
            }
        }

        let bot = file
            .bot
            .iter()
            .map(CompiledRule::compile)
            .collect::<WafResult<Vec<_>>>()?;
        let payload = file
            .payload
            .iter()
            .map(CompiledRule::compile)
            .collect::<WafResult<Vec<_>>>()?;

        Ok(Self {
            version: file.version.clone(),
            bot,
            payload,
        })
    }

    pub fn from_toml_str(content: &str) -> WafResult<Self> {
        let file: RuleFile = toml::from_str(content)
            .map_err(|e| WafError::validation("<file>", format!("unparseable rule table: {}", e)))?;
        Self::from_rule_file(&file)
    }

    /// Load and compile a rules file from disk.
    pub fn load(path: &str) -> WafResult<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| WafError::Configuration(format!("cannot read rules file {}: {}", path, e)))?;
        let library = Self::from_toml_str(&content)?;
        info!(
            path = %path,
            version = %library.version,
            bot_rules = library.bot.len(),
            payload_rules = library.payload.len(),
            "Rule table loaded"
        );
        Ok(library)
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// First bot signature matching the user agent, in table order.
    pub fn first_bot_match(&self, user_agent: &str) -> Option<&CompiledRule> {
        self.bot.iter().find(|rule| rule.is_match(user_agent))
    }

    pub fn payload_rules(&self) -> &[CompiledRule] {
        &self.payload
    }

    pub fn bot_rule_count(&self) -> usize {
        self.bot.len()
    }

    pub fn payload_rule_count(&self) -> usize {
        self.payload.len()
    }
}

// Offensive tooling comes first: only the first matching signature counts.
const BUILTIN_BOT: &[(&str, &str, &str, bool)] = &[
    ("scanner.sqlmap", r"(?i)sqlmap", "scanner", true),
    ("scanner.nikto", r"(?i)nikto", "scanner", true),
    ("scanner.nmap", r"(?i)\bnmap\b", "scanner", true),
    ("scanner.masscan", r"(?i)masscan", "scanner", true),
    ("scanner.zgrab", r"(?i)zgrab", "scanner", true),
    ("scanner.nuclei", r"(?i)nuclei", "scanner", true),
    ("scanner.dirbuster", r"(?i)(dirbuster|gobuster|dirb/|ffuf|feroxbuster)", "scanner", true),
    ("scanner.wpscan", r"(?i)(wpscan|joomscan)", "scanner", true),
    ("scanner.commercial", r"(?i)(acunetix|nessus|openvas|netsparker|appscan|w3af|burpsuite|havij)", "scanner", true),
    ("headless.browser", r"(?i)(headlesschrome|phantomjs|selenium|puppeteer|playwright|slimerjs)", "headless", false),
    ("client.scripted", r"(?i)^(curl|wget|python-requests|python-urllib|go-http-client|java/|libwww-perl|okhttp|apache-httpclient|axios|node-fetch|httpie|scrapy)", "automation", false),
    ("crawler.search", r"(?i)(googlebot|bingbot|yandexbot|baiduspider|duckduckbot|slurp|applebot|sogou)", "crawler", false),
    ("crawler.seo", r"(?i)(ahrefsbot|semrushbot|mj12bot|dotbot|petalbot|bytespider|gptbot)", "crawler", false),
    ("crawler.generic", r"(?i)(bot|crawl|spider|scrape)", "crawler", false),
    ("agent.empty", r"^\s*$", "suspicious_agent", false),
    ("agent.generic", r"(?i)^(mozilla/[45]\.0|-|\*|test|user-agent|unknown|null)$", "suspicious_agent", false),
];

// Patterns match decoded text only: percent-encoded input is handled by the
// scanner's single decode pass.
const BUILTIN_PAYLOAD: &[(&str, &str, &str)] = &[
    ("sqli.tautology", r"(?i)'\s*(or|and)\s*'", "sql_injection"),
    ("sqli.numeric_tautology", r"(?i)\b(or|and)\s+\d+\s*=\s*\d+", "sql_injection"),
    ("sqli.union", r"(?i)\bunion\b(\s+all)?\s+select\b", "sql_injection"),
    ("sqli.stacked", r"(?i);\s*(drop|delete|update|insert|truncate|alter)\s", "sql_injection"),
    ("sqli.comment", r"'\s*(--|#|/\*)", "sql_injection"),
    ("sqli.timing", r"(?i)\b(sleep|benchmark|pg_sleep)\s*\(|waitfor\s+delay", "sql_injection"),
    ("xss.script", r"(?i)<\s*script[^>]*>", "xss"),
    ("xss.handler", r"(?i)<[^>]+\bon[a-z]+\s*=", "xss"),
    ("xss.protocol", r"(?i)(javascript|vbscript)\s*:", "xss"),
    ("xss.frame", r"(?i)<\s*(iframe|object|embed)\b", "xss"),
    ("traversal.dotdot", r"\.\.[/\\]", "path_traversal"),
    ("traversal.sensitive", r"(?i)(/etc/(passwd|shadow|hosts)|boot\.ini|win\.ini)", "path_traversal"),
    // The command word must be followed by an argument, a pipe or the end of
    // input, so `; id=7` in a cookie or `&id=5` in a form is not a command.
    (
        "cmd.chain",
        r"(?i)[;&|`]\s*(cat|ls|id|whoami|uname|wget|curl|nc|bash|sh|rm|ping)(\s+[^=\s&;]|\s*\||\s*$)",
        "command_injection",
    ),
    ("cmd.substitution", r"\$\([^)]*\)", "command_injection"),
    ("xxe.entity", r"(?i)<!(entity|doctype)[^>]*(system|public)", "xxe"),
    ("ssrf.scheme", r"(?i)\b(file|gopher|dict|ldap)://", "ssrf"),
    ("ssrf.metadata", r"(?i)(169\.254\.169\.254|metadata\.google\.internal)", "ssrf"),
    ("template.injection", r"\{\{[^}]*\}\}|\$\{[^}]*\}", "template_injection"),
    ("control.characters", r"[\x00-\x08\x0b\x0c\x0e-\x1f]", "control_characters"),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_compiles() {
        let library = PatternLibrary::builtin().unwrap();
        assert_eq!(library.version(), BUILTIN_VERSION);
        assert!(library.bot_rule_count() > 10);
        assert!(library.payload_rule_count() > 10);
    }

    #[test]
    fn test_first_bot_match_prefers_scanners() {
        let library = PatternLibrary::builtin().unwrap();
        let rule = library.first_bot_match("sqlmap/1.0 (bot)").unwrap();
        assert_eq!(rule.id, "scanner.sqlmap");
        assert!(rule.malicious);

        let rule = library.first_bot_match("Mozilla/5.0 (compatible; Googlebot/2.1)").unwrap();
        assert_eq!(rule.category, "crawler");
        assert!(!rule.malicious);

        assert!(library
            .first_bot_match("Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 Chrome/120.0 Safari/537.36")
            .is_none());
        assert_eq!(library.first_bot_match("").unwrap().id, "agent.empty");
    }

    #[test]
    fn test_payload_rules_ignore_percent_encoding() {
        let library = PatternLibrary::builtin().unwrap();
        let encoded = "%27%20OR%20%271%27%3D%271";
        assert!(library.payload_rules().iter().all(|r| !r.is_match(encoded)));
        assert!(library.payload_rules().iter().any(|r| r.is_match("' OR '1'='1")));
    }

    #[test]
    fn test_toml_table_loads() {
        let library = PatternLibrary::from_toml_str(
            r#"
            version = "2024-06-01"

            [[bot]]
            id = "scanner.custom"
            pattern = "(?i)evilscan"
            category = "scanner"
            malicious = true

            [[payload]]
            id = "custom.marker"
            pattern = "DROPME"
            category = "custom"
            weight = 40
            "#,
        )
        .unwrap();
        assert_eq!(library.version(), "2024-06-01");
        assert!(library.first_bot_match("EvilScan/2").unwrap().malicious);
        assert_eq!(library.payload_rules()[0].weight, 40);
    }

    #[test]
    fn test_invalid_tables_are_rejected() {
        let bad_regex = r#"
            version = "1"
            [[payload]]
            id = "broken"
            pattern = "(unclosed"
            category = "x"
        "#;
        match PatternLibrary::from_toml_str(bad_regex) {
            Err(WafError::Validation { rule_id, .. }) => assert_eq!(rule_id, "broken"),
            other => panic!("expected validation error, got {:?}", other),
        }

        let zero_weight = r#"
            version = "1"
            [[payload]]
            id = "zero"
            pattern = "x"
            category = "x"
            weight = 0
        "#;
        assert!(PatternLibrary::from_toml_str(zero_weight).is_err());

        let empty_id = r#"
            version = "1"
            [[bot]]
            id = ""
            pattern = "x"
            category = "x"
        "#;
        assert!(PatternLibrary::from_toml_str(empty_id).is_err());

        let duplicate = r#"
            version = "1"
            [[bot]]
            id = "dup"
            pattern = "x"
            category = "x"
            [[payload]]
            id = "dup"
            pattern = "y"
            category = "y"
        "#;
        assert!(PatternLibrary::from_toml_str(duplicate).is_err());
    }
}
