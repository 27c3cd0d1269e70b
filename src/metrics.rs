//! Metrics instrumentation for template-dns.
//!
//! All metrics are prefixed with `template_dns.`

use metrics::{counter, gauge, histogram};
use std::time::Instant;

/// Record a handled DNS query.
pub fn record_query(record_type: &str, result: QueryResult, duration: std::time::Duration) {
    let result_str = match result {
        QueryResult::Answered => "answered",
        QueryResult::PassThrough => "pass_through",
        QueryResult::ServFail => "servfail",
    };

    counter!("template_dns.query.count", "type" => record_type.to_string(), "result" => result_str)
        .increment(1);
    histogram!("template_dns.query.duration.seconds", "type" => record_type.to_string())
        .record(duration.as_secs_f64());
}

/// What happened to a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryResult {
    /// A rule matched and records were sent.
    Answered,
    /// No rule applied; the next handler answered.
    PassThrough,
    /// Resolution or rendering failed.
    ServFail,
}

/// Record a template that failed to render.
pub fn record_render_failure(section: &str) {
    counter!("template_dns.render.failure.count", "section" => section.to_string()).increment(1);
}

/// Record records returned for an answered query.
pub fn record_records_returned(count: usize) {
    histogram!("template_dns.query.records_returned").record(count as f64);
}

/// Record the number of loaded rules of one pattern kind.
pub fn record_rule_count(kind: &str, count: usize) {
    gauge!("template_dns.rules.count", "kind" => kind.to_string()).set(count as f64);
}

/// Helper for timing operations.
pub struct Timer {
    start: Instant,
}

impl Timer {
    /// Start a new timer.
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed duration since timer start.
    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }
}
