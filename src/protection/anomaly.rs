use chrono::Timelike;
use tracing::debug;

use crate::models::request::RequestContext;

const LARGE_BODY_BYTES: usize = 100 * 1024;
const MAX_HEADERS: usize = 50;
const MAX_PATH_LEN: usize = 1000;
const MAX_QUERY_PARAMS: usize = 20;
const OFF_HOURS: std::ops::RangeInclusive<u32> = 2..=5;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnomalyDetection {
    pub is_anomalous: bool,
    pub score: u32,
    pub anomalies: Vec<String>,
}

/// Scores the shape of a request (sizes, counts, time of day).
pub struct AnomalyDetector {
    threshold: u32,
}

impl AnomalyDetector {
    pub fn new(threshold: u32) -> Self {
        Self { threshold }
    }

    pub fn detect(&self, ctx: &RequestContext) -> AnomalyDetection {
        let mut detection = AnomalyDetection::default();

        if ctx.body.len() > LARGE_BODY_BYTES {
            detection.score += 30;
            detection.anomalies.push("large_body".into());
        }
        if ctx.headers.len() > MAX_HEADERS {
            detection.score += 25;
            detection.anomalies.push("excessive_headers".into());
        }
        if ctx.path.len() > MAX_PATH_LEN {
            detection.score += 35;
            detection.anomalies.push("long_path".into());
        }
        if ctx.query_param_count() > MAX_QUERY_PARAMS {
            detection.score += 20;
            detection.anomalies.push("excessive_query_params".into());
        }
        if OFF_HOURS.contains(&ctx.received_at.hour()) {
            detection.score += 10;
            detection.anomalies.push("off_hours".into());
        }

        detection.is_anomalous = detection.score >= self.threshold;
        if detection.is_anomalous {
            debug!(
                ip = %ctx.client_ip,
                score = detection.score,
                anomalies = ?detection.anomalies,
                "Anomalous request shape"
            );
        }
        detection
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Local, TimeZone};

    fn at_hour(hour: u32) -> chrono::DateTime<Local> {
        Local
            .with_ymd_and_hms(2024, 6, 1, hour, 30, 0)
            .single()
            .expect("unambiguous local time")
    }

    #[test]
    fn test_normal_request_is_clean() {
        let detector = AnomalyDetector::new(85);
        let ctx = RequestContext::new("1.2.3.4", "GET", "/index.html").with_received_at(at_hour(14));
        let detection = detector.detect(&ctx);
        assert_eq!(detection.score, 0);
        assert!(!detection.is_anomalous);
    }

    #[test]
    fn test_scores_accumulate_to_threshold() {
        let detector = AnomalyDetector::new(85);
        let query: Vec<String> = (0..21).map(|i| format!("k{}=v", i)).collect();
        let ctx = RequestContext::new("1.2.3.4", "POST", format!("/{}", "a".repeat(1200)))
            .with_query(&query.join("&"))
            .with_body(vec![b'x'; 100 * 1024 + 1])
            .with_received_at(at_hour(12));
        let detection = detector.detect(&ctx);
        assert_eq!(detection.score, 85);
        assert!(detection.is_anomalous);
        assert_eq!(detection.anomalies.len(), 3);
    }

    #[test]
    fn test_off_hours_and_header_flood() {
        let detector = AnomalyDetector::new(85);
        let mut ctx = RequestContext::new("1.2.3.4", "GET", "/").with_received_at(at_hour(3));
        for i in 0..51 {
            ctx = ctx.with_header(&format!("x-custom-{}", i), "1");
        }
        let detection = detector.detect(&ctx);
        assert_eq!(detection.score, 35);
        assert!(!detection.is_anomalous);
        assert!(detection.anomalies.contains(&"off_hours".to_string()));
    }
}
