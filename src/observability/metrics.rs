//! Metric recording for the authorization and admission paths
//!
//! Labels are drawn from small fixed sets. User ids, client ids and IPs are
//! never used as labels.
//!
//! Recording is a no-op until a recorder is installed (see
//! [`init_metrics`](super::recorder::init_metrics)), so library users that
//! do not export metrics pay nothing.

use metrics::{counter, histogram};
use std::time::Duration;

pub fn record_permission_cache_lookup(hit: bool) {
    counter!(
        "permission_cache_lookup_total",
        "result" => if hit { "hit" } else { "miss" }
    )
    .increment(1);
}

pub fn record_cache_invalidation(cache: &'static str) {
    counter!("cache_invalidation_total", "cache" => cache).increment(1);
}

pub fn record_authorization_decision(allowed: bool, source: &'static str) {
    counter!(
        "authorization_decision_total",
        "result" => if allowed { "allowed" } else { "denied" },
        "source" => source
    )
    .increment(1);
}

/// `outcome` is one of: immediate, queued, admitted, queue_full, timeout,
/// cancelled, shutdown
pub fn record_admission(outcome: &'static str) {
    counter!("admission_total", "outcome" => outcome).increment(1);
}

pub fn record_admission_wait(waited: Duration) {
    histogram!("admission_queue_wait_seconds").record(waited.as_secs_f64());
}

/// `role` is `leader` for calls that ran the work, `follower` for calls
/// that joined
pub fn record_dedup(role: &'static str) {
    counter!("dedup_calls_total", "role" => role).increment(1);
}

pub fn record_response_cache_lookup(hit: bool) {
    counter!(
        "response_cache_lookup_total",
        "result" => if hit { "hit" } else { "miss" }
    )
    .increment(1);
}

/// Bucket HTTP status codes to control cardinality
pub fn bucket_status_code(status: u16) -> &'static str {
    match status {
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        500..=599 => "5xx",
        _ => "other",
    }
}

pub fn record_http_request(method: &str, status_code: u16, duration: Duration) {
    let status = bucket_status_code(status_code);
    counter!(
        "http_request_total",
        "method" => method.to_string(),
        "status" => status
    )
    .increment(1);
    histogram!(
        "http_request_duration_seconds",
        "method" => method.to_string(),
        "status" => status
    )
    .record(duration.as_secs_f64());
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_exporter_prometheus::PrometheusBuilder;

    fn rendered(record: impl FnOnce()) -> String {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        metrics::with_local_recorder(&recorder, record);
        handle.render()
    }

    #[test]
    fn test_authorization_metrics() {
        let output = rendered(|| {
            record_permission_cache_lookup(true);
            record_permission_cache_lookup(false);
            record_authorization_decision(false, "store");
        });

        assert!(output.contains("permission_cache_lookup_total{result=\"hit\"} 1"));
        assert!(output.contains("permission_cache_lookup_total{result=\"miss\"} 1"));
        assert!(output.contains("authorization_decision_total"));
        assert!(output.contains("result=\"denied\""));
        assert!(output.contains("source=\"store\""));
    }

    #[test]
    fn test_admission_and_dedup_metrics() {
        let output = rendered(|| {
            record_admission("queued");
            record_admission("queued");
            record_admission_wait(Duration::from_millis(250));
            record_dedup("leader");
        });

        assert!(output.contains("admission_total{outcome=\"queued\"} 2"));
        assert!(output.contains("admission_queue_wait_seconds"));
        assert!(output.contains("dedup_calls_total{role=\"leader\"} 1"));
    }

    #[test]
    fn test_status_code_bucketing() {
        assert_eq!(bucket_status_code(200), "2xx");
        assert_eq!(bucket_status_code(304), "3xx");
        assert_eq!(bucket_status_code(429), "4xx");
        assert_eq!(bucket_status_code(503), "5xx");
        assert_eq!(bucket_status_code(100), "other");
    }
}
