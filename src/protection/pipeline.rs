use std::collections::{BTreeMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use arc_swap::ArcSwap;
use futures_util::FutureExt;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::config::settings::Settings;
use crate::error::{WafError, WafResult};
use crate::models::event::{SecurityEvent, CLEARANCE_DETAIL};
use crate::models::metrics::{HealthReport, HealthStatus, PipelineStats};
use crate::models::request::RequestContext;
use crate::models::threat::{EventAction, ResponseAction, SecurityEventType, Severity};
use crate::storage::events::EventStore;
use crate::storage::ReputationStore;

use super::anomaly::AnomalyDetector;
use super::bot_detector::BotDetector;
use super::challenge::ChallengeSystem;
use super::geoip::{GeoResolver, LOCAL};
use super::ip_reputation::{ReputationCache, ReputationSource};
use super::patterns::PatternLibrary;
use super::payload::PayloadScanner;
use super::rate_limiter::RateLimiter;

/// Headers attached to every response that is allowed through.
pub const SECURITY_HEADERS: &[(&str, &str)] = &[
    ("x-content-type-options", "nosniff"),
    ("x-frame-options", "DENY"),
    ("x-xss-protection", "1; mode=block"),
    ("referrer-policy", "strict-origin-when-cross-origin"),
    ("permissions-policy", "geolocation=(), microphone=(), camera=()"),
];

/// Final decision for one request.
#[derive(Debug, Clone)]
pub enum Verdict {
    /// Forward upstream. `event` is set when a stage tripped but the request
    /// was let through (monitor mode or a valid clearance cookie).
    Allow {
        event: Option<Arc<SecurityEvent>>,
        failed_open: bool,
    },
    /// 403 with a JSON body.
    Block { event: Arc<SecurityEvent>, body: String },
    /// 429 with the challenge page.
    Challenge {
        event: Arc<SecurityEvent>,
        challenge_id: String,
        page: String,
    },
}

impl Verdict {
    fn allow() -> Self {
        Verdict::Allow {
            event: None,
            failed_open: false,
        }
    }

    fn fail_open() -> Self {
        Verdict::Allow {
            event: None,
            failed_open: true,
        }
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, Verdict::Allow { .. })
    }

    pub fn event(&self) -> Option<&Arc<SecurityEvent>> {
        match self {
            Verdict::Allow { event, .. } => event.as_ref(),
            Verdict::Block { event, .. } | Verdict::Challenge { event, .. } => Some(event),
        }
    }
}

/// A stage that decided to stop the request.
#[derive(Debug)]
struct Detection {
    event_type: SecurityEventType,
    severity: Severity,
    score: u32,
    details: BTreeMap<String, Value>,
}

impl Detection {
    fn new(event_type: SecurityEventType, severity: Severity, score: u32) -> Self {
        Self {
            event_type,
            severity,
            score,
            details: BTreeMap::new(),
        }
    }

    fn detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }

    /// Only bot and rate-limit hits can be waived by a solved challenge.
    fn clearable(&self) -> bool {
        matches!(
            self.event_type,
            SecurityEventType::BotDetected | SecurityEventType::RateLimitExceeded
        )
    }
}

/// Runs the detection stages in order and turns the first hit into a response.
///
/// Owns every piece of per-IP state; share it behind an `Arc`.
pub struct ProtectionPipeline {
    patterns: ArcSwap<PatternLibrary>,
    rules_path: Option<String>,
    rate_limiter: RateLimiter,
    reputation: ReputationCache,
    geo: GeoResolver,
    bot: BotDetector,
    anomaly: AnomalyDetector,
    payload: PayloadScanner,
    challenge: ChallengeSystem,
    events: Arc<EventStore>,
    response_action: ResponseAction,
    skip_reputation_check: bool,
    blocked_countries: HashSet<String>,
    allowed_countries: HashSet<String>,
    event_retention_secs: i64,
}

impl ProtectionPipeline {
    /// Build the pipeline from settings. Fails if the configured rules file is invalid.
    pub fn new(settings: &Settings, store: Arc<dyn ReputationStore>) -> WafResult<Self> {
        Self::with_parts(settings, store, GeoResolver::from_config(&settings.geo), Vec::new())
    }

    pub fn with_parts(
        settings: &Settings,
        store: Arc<dyn ReputationStore>,
        geo: GeoResolver,
        sources: Vec<Arc<dyn ReputationSource>>,
    ) -> WafResult<Self> {
        let patterns = match settings.rules.path.as_deref() {
            Some(path) => PatternLibrary::load(path)?,
            None => PatternLibrary::builtin()?,
        };

        let events = Arc::new(EventStore::new(settings.events.capacity));
        let mut reputation = ReputationCache::new(
            &settings.reputation,
            &settings.protection,
            Arc::clone(&events),
            store,
        );
        for source in sources {
            reputation = reputation.with_source(source);
        }

        let protection = &settings.protection;
        let normalize = |codes: &[String]| -> HashSet<String> {
            codes.iter().map(|c| c.trim().to_ascii_uppercase()).collect()
        };

        info!(
            rules_version = %patterns.version(),
            bot_rules = patterns.bot_rule_count(),
            payload_rules = patterns.payload_rule_count(),
            response_action = %protection.response_action,
            "Protection pipeline initialised"
        );

        Ok(Self {
            patterns: ArcSwap::from_pointee(patterns),
            rules_path: settings.rules.path.clone(),
            rate_limiter: RateLimiter::new(protection.per_ip_rate_limit, protection.rate_limit_window_secs),
            reputation,
            geo,
            bot: BotDetector::new(protection.bot_score_threshold, settings.bot_classification_threshold()),
            anomaly: AnomalyDetector::new(protection.anomaly_threshold),
            payload: PayloadScanner::new(),
            challenge: ChallengeSystem::new(&settings.challenge),
            events,
            response_action: protection.response_action,
            skip_reputation_check: protection.skip_reputation_check,
            blocked_countries: normalize(&settings.geo.blocked_countries),
            allowed_countries: normalize(&settings.geo.allowed_countries),
            event_retention_secs: settings.events.retention_secs,
        })
    }

    /// Evaluate one request. Never fails: internal faults allow the request.
    pub async fn evaluate(&self, ctx: &RequestContext) -> Verdict {
        match AssertUnwindSafe(self.run_stages(ctx)).catch_unwind().await {
            Ok(Ok(verdict)) => verdict,
            Ok(Err(e)) => {
                error!(ip = %ctx.client_ip, path = %ctx.path, error = %e, "Pipeline error, failing open");
                Verdict::fail_open()
            }
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                let e = WafError::pipeline("evaluate", message);
                error!(ip = %ctx.client_ip, path = %ctx.path, error = %e, "Pipeline panicked, failing open");
                Verdict::fail_open()
            }
        }
    }

    async fn run_stages(&self, ctx: &RequestContext) -> WafResult<Verdict> {
        if !self.skip_reputation_check {
            let hit = self.check_reputation(ctx).await;
            if let Some(detection) = self.inconclusive_on_error("reputation", ctx, hit) {
                return self.respond(ctx, detection);
            }
        }

        let hit = self.check_geo(ctx).await;
        if let Some(detection) = self.inconclusive_on_error("geo", ctx, hit) {
            return self.respond(ctx, detection);
        }

        let hit = self.check_rate_limit(ctx);
        if let Some(detection) = self.inconclusive_on_error("rate_limit", ctx, hit) {
            return self.respond(ctx, detection);
        }

        let patterns = self.patterns.load_full();

        let hit = self.check_bot(ctx, &patterns);
        if let Some(detection) = self.inconclusive_on_error("bot", ctx, hit) {
            return self.respond(ctx, detection);
        }

        let hit = self.check_anomaly(ctx);
        if let Some(detection) = self.inconclusive_on_error("anomaly", ctx, hit) {
            return self.respond(ctx, detection);
        }

        let hit = self.check_payload(ctx, &patterns);
        if let Some(detection) = self.inconclusive_on_error("payload", ctx, hit) {
            return self.respond(ctx, detection);
        }

        Ok(Verdict::allow())
    }

    fn inconclusive_on_error(
        &self,
        stage: &'static str,
        ctx: &RequestContext,
        result: WafResult<Option<Detection>>,
    ) -> Option<Detection> {
        match result {
            Ok(detection) => detection,
            Err(e) => {
                warn!(stage = stage, ip = %ctx.client_ip, error = %e, "Stage inconclusive");
                None
            }
        }
    }

    // -----------------------------------------------------------------------
    // Stages
    // -----------------------------------------------------------------------

    async fn check_reputation(&self, ctx: &RequestContext) -> WafResult<Option<Detection>> {
        let Some(lookup) = self.reputation.get_reputation(&ctx.client_ip).await else {
            return Ok(None);
        };
        if !lookup.blocked {
            return Ok(None);
        }
        let intel = lookup.intel;
        Ok(Some(
            Detection::new(SecurityEventType::ReputationBlocked, Severity::High, intel.reputation())
                .detail("reputation", intel.reputation())
                .detail("isMalicious", intel.is_malicious)
                .detail("categories", intel.categories.into_iter().collect::<Vec<_>>())
                .detail("sources", intel.sources.into_iter().collect::<Vec<_>>()),
        ))
    }

    async fn check_geo(&self, ctx: &RequestContext) -> WafResult<Option<Detection>> {
        if self.blocked_countries.is_empty() && self.allowed_countries.is_empty() {
            return Ok(None);
        }
        let country = self.geo.get_country(&ctx.client_ip).await;

        let reason = if self.blocked_countries.contains(&country) {
            Some("blocked_country")
        } else if !self.allowed_countries.is_empty()
            && country != LOCAL
            && !self.allowed_countries.contains(&country)
        {
            Some("not_in_allow_list")
        } else {
            None
        };

        Ok(reason.map(|reason| {
            Detection::new(SecurityEventType::GeoBlocked, Severity::Medium, 100)
                .detail("country", country)
                .detail("reason", reason)
        }))
    }

    fn check_rate_limit(&self, ctx: &RequestContext) -> WafResult<Option<Detection>> {
        let decision = self.rate_limiter.check(&ctx.client_ip);
        if !decision.blocked {
            return Ok(None);
        }
        let score = u32::try_from(decision.requests).unwrap_or(u32::MAX);
        Ok(Some(
            Detection::new(SecurityEventType::RateLimitExceeded, Severity::Medium, score)
                .detail("limit", decision.limit)
                .detail("requests", decision.requests)
                .detail("remaining", decision.remaining)
                .detail("resetTime", decision.reset_time.to_rfc3339()),
        ))
    }

    fn check_bot(&self, ctx: &RequestContext, patterns: &PatternLibrary) -> WafResult<Option<Detection>> {
        let detection = self.bot.detect(ctx, patterns);
        if !self.bot.should_block(&detection) {
            return Ok(None);
        }
        let severity = if detection.is_malicious {
            Severity::Critical
        } else {
            Severity::High
        };
        let mut hit = Detection::new(SecurityEventType::BotDetected, severity, detection.score)
            .detail("isMalicious", detection.is_malicious)
            .detail("reasons", detection.reasons);
        if let Some(signature) = detection.signature {
            hit = hit.detail("signature", signature);
        }
        Ok(Some(hit))
    }

    fn check_anomaly(&self, ctx: &RequestContext) -> WafResult<Option<Detection>> {
        let detection = self.anomaly.detect(ctx);
        if !detection.is_anomalous {
            return Ok(None);
        }
        Ok(Some(
            Detection::new(SecurityEventType::AnomalyDetected, Severity::Medium, detection.score)
                .detail("anomalies", detection.anomalies),
        ))
    }

    fn check_payload(&self, ctx: &RequestContext, patterns: &PatternLibrary) -> WafResult<Option<Detection>> {
        let analysis = self.payload.analyze(ctx, patterns);
        if !analysis.is_malicious {
            return Ok(None);
        }
        let threats: Vec<Value> = analysis
            .threats
            .iter()
            .map(|t| json!({"rule": t.rule_id, "category": t.category, "decoded": t.decoded}))
            .collect();
        Ok(Some(
            Detection::new(SecurityEventType::AnomalyDetected, Severity::Critical, analysis.score)
                .detail("source", "payload")
                .detail("threats", threats),
        ))
    }

    // -----------------------------------------------------------------------
    // Response strategies
    // -----------------------------------------------------------------------

    fn respond(&self, ctx: &RequestContext, detection: Detection) -> WafResult<Verdict> {
        let cleared = self.response_action == ResponseAction::Challenge
            && detection.clearable()
            && self
                .challenge
                .has_valid_clearance(&ctx.client_ip, ctx.header("cookie"));
        let action = if cleared {
            EventAction::Allowed
        } else {
            self.response_action.event_action()
        };

        let mut details = detection.details;
        if cleared {
            details.insert(CLEARANCE_DETAIL.to_string(), Value::Bool(true));
        }
        let event = self.events.push(SecurityEvent::new(
            ctx,
            detection.event_type,
            detection.severity,
            action,
            detection.score,
            details,
        ));

        if cleared {
            debug!(ip = %ctx.client_ip, event_type = %event.event_type(), "Clearance cookie accepted");
            return Ok(Verdict::Allow {
                event: Some(event),
                failed_open: false,
            });
        }

        match self.response_action {
            ResponseAction::Block => {
                info!(
                    ip = %ctx.client_ip,
                    path = %ctx.path,
                    event_type = %event.event_type(),
                    severity = %event.severity(),
                    score = event.score(),
                    "Request blocked"
                );
                let body = json!({
                    "error": "Forbidden",
                    "message": "Request blocked by security policy",
                    "eventId": event.id(),
                    "timestamp": event.timestamp().to_rfc3339(),
                });
                Ok(Verdict::Block {
                    event,
                    body: serde_json::to_string(&body)?,
                })
            }
            ResponseAction::Challenge => {
                let challenge_id = self.challenge.issue(&ctx.client_ip);
                info!(
                    ip = %ctx.client_ip,
                    path = %ctx.path,
                    event_type = %event.event_type(),
                    score = event.score(),
                    "Request challenged"
                );
                let page = self.challenge.render_page(&challenge_id);
                Ok(Verdict::Challenge {
                    event,
                    challenge_id,
                    page,
                })
            }
            ResponseAction::Monitor => {
                warn!(
                    ip = %ctx.client_ip,
                    path = %ctx.path,
                    event_type = %event.event_type(),
                    severity = %event.severity(),
                    score = event.score(),
                    "Threat detected (monitor mode, allowing)"
                );
                Ok(Verdict::Allow {
                    event: Some(event),
                    failed_open: false,
                })
            }
        }
    }

    // -----------------------------------------------------------------------
    // Introspection and maintenance
    // -----------------------------------------------------------------------

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            active_rate_limit_entries: self.rate_limiter.len(),
            reputation_cache_size: self.reputation.len(),
            recent_event_count: self.events.len(),
            events_by_type: self.events.counts_by_type(),
            events_by_severity: self.events.counts_by_severity(),
        }
    }

    pub fn health_check(&self) -> HealthReport {
        match std::panic::catch_unwind(AssertUnwindSafe(|| self.stats())) {
            Ok(stats) => HealthReport {
                status: HealthStatus::Healthy,
                stats: Some(stats),
                error: None,
            },
            Err(_) => HealthReport {
                status: HealthStatus::Error,
                stats: None,
                error: Some("failed to collect pipeline statistics".to_string()),
            },
        }
    }

    /// Re-read the rules file and swap it in. On failure the current table stays.
    pub fn reload_rules(&self) -> WafResult<String> {
        let library = match self.rules_path.as_deref() {
            Some(path) => PatternLibrary::load(path),
            None => PatternLibrary::builtin(),
        };
        match library {
            Ok(library) => {
                let version = library.version().to_string();
                info!(
                    version = %version,
                    bot_rules = library.bot_rule_count(),
                    payload_rules = library.payload_rule_count(),
                    "Rule table reloaded"
                );
                self.patterns.store(Arc::new(library));
                Ok(version)
            }
            Err(e) => {
                warn!(
                    error = %e,
                    current_version = %self.patterns.load().version(),
                    "Rule reload rejected, keeping current table"
                );
                Err(e)
            }
        }
    }

    pub fn rules_version(&self) -> String {
        self.patterns.load().version().to_string()
    }

    /// Periodic sweep of every in-memory table.
    pub fn run_maintenance(&self) {
        let rate_limits = self.rate_limiter.cleanup();
        let reputations = self.reputation.cleanup();
        let countries = self.geo.cleanup();
        let challenges = self.challenge.cleanup();
        let events = self.events.cleanup(self.event_retention_secs);
        debug!(
            rate_limits = rate_limits,
            reputations = reputations,
            countries = countries,
            challenges = challenges,
            events = events,
            geo_cache = self.geo.cache_len(),
            pending_challenges = self.challenge.pending_count(),
            "Maintenance sweep complete"
        );
    }

    pub fn events(&self) -> &EventStore {
        &self.events
    }

    pub fn reputation(&self) -> &ReputationCache {
        &self.reputation
    }

    pub fn challenge(&self) -> &ChallengeSystem {
        &self.challenge
    }

    pub fn response_action(&self) -> ResponseAction {
        self.response_action
    }

    pub fn rate_limit(&self) -> u64 {
        self.rate_limiter.limit()
    }
}
