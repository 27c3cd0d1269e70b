//! Configuration types for template-dns.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// DNS server configuration.
    pub dns: DnsConfig,

    /// Rules, in priority tie-break order.
    #[serde(default)]
    pub rules: Vec<RuleConfig>,

    /// Telemetry configuration.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// DNS server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsConfig {
    /// Address for DNS server to listen on (UDP and TCP).
    pub listen_addr: SocketAddr,

    /// Idle timeout for TCP connections, in seconds.
    #[serde(default = "default_tcp_timeout_secs")]
    pub tcp_timeout_secs: u64,

    /// How matching rules are turned into a response.
    #[serde(default)]
    pub policy: ResolutionPolicy,
}

/// Rule selection policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResolutionPolicy {
    /// Answer from the single most specific matching rule.
    #[default]
    HighestPriority,
    /// Answer from every matching rule, most specific first, until one
    /// without `fallthrough`.
    Accumulate,
}

impl fmt::Display for ResolutionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolutionPolicy::HighestPriority => f.write_str("highest-priority"),
            ResolutionPolicy::Accumulate => f.write_str("accumulate"),
        }
    }
}

/// One rule as written in the configuration file.
///
/// ```toml
/// [[rules]]
/// pattern = "subdomain:example.org"
/// type = "TXT"
/// answer = ['{{ .Name }} 60 IN TXT "hit"']
///
/// [[rules]]
/// pattern = "domain:example.net"
/// answer = [{ address = "10.0.0.1", ttl = 120 }, { address = "fd00::1" }]
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleConfig {
    /// Pattern, optionally prefixed with `regexp:`, `keyword:`, `domain:`
    /// or `subdomain:`. Unprefixed patterns match the exact name.
    pub pattern: String,

    /// Class filter (`IN`, `CH`, `HS`, `ANY`).
    #[serde(default = "default_class")]
    pub class: String,

    /// Type filter (`A`, `TXT`, ..., `ANY`).
    #[serde(rename = "type", default = "default_type")]
    pub record_type: String,

    /// Keep collecting lower-priority rules after this one. Only used with
    /// the `accumulate` policy.
    #[serde(default)]
    pub fallthrough: bool,

    /// Answer section records.
    #[serde(default)]
    pub answer: Vec<RecordSpec>,

    /// Additional section records.
    #[serde(default)]
    pub additional: Vec<RecordSpec>,

    /// Authority section records.
    #[serde(default)]
    pub authority: Vec<RecordSpec>,
}

impl Default for RuleConfig {
    fn default() -> Self {
        Self {
            pattern: String::new(),
            class: default_class(),
            record_type: default_type(),
            fallthrough: false,
            answer: Vec::new(),
            additional: Vec::new(),
            authority: Vec::new(),
        }
    }
}

/// A record slot: either a template line or a static address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordSpec {
    /// Master-file line template, e.g. `{{ .Name }} 60 IN A 10.0.0.1`.
    Template(String),
    /// Static address with optional TTL (default 60).
    Static {
        /// IPv4 or IPv6 address.
        address: String,
        /// TTL in seconds, `0..=2147483647`.
        #[serde(default)]
        ttl: Option<i64>,
    },
}

/// Telemetry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level filter (e.g., "info", "debug", "template_dns=debug,warn").
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Prometheus metrics exporter address.
    #[serde(default)]
    pub prometheus_addr: Option<SocketAddr>,

    /// OpenTelemetry configuration. Used with the `otel` feature.
    #[serde(default)]
    pub opentelemetry: Option<OpenTelemetryConfig>,
}

/// OpenTelemetry exporter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenTelemetryConfig {
    /// OTLP endpoint (e.g., "http://localhost:4317").
    pub endpoint: String,

    /// Service name for traces.
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            prometheus_addr: None,
            opentelemetry: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_service_name() -> String {
    "template-dns".to_string()
}

fn default_tcp_timeout_secs() -> u64 {
    30
}

fn default_class() -> String {
    "IN".to_string()
}

fn default_type() -> String {
    "ANY".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[dns]
listen_addr = "127.0.0.1:5353"
policy = "accumulate"

[[rules]]
pattern = "subdomain:example.org"
type = "TXT"
fallthrough = true
answer = ['{{ .Name }} IN TXT "hit"']

[[rules]]
pattern = "domain:example.net"
answer = [{ address = "10.0.0.1", ttl = 120 }, { address = "fd00::1" }]
"#;

    fn load(text: &str) -> Config {
        config::Config::builder()
            .add_source(config::File::from_str(text, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    #[test]
    fn test_sample_config_deserializes() {
        let config = load(SAMPLE);
        assert_eq!(config.dns.policy, ResolutionPolicy::Accumulate);
        assert_eq!(config.dns.tcp_timeout_secs, 30);
        assert_eq!(config.telemetry.log_level, "info");
        assert_eq!(config.rules.len(), 2);

        let txt = &config.rules[0];
        assert_eq!(txt.record_type, "TXT");
        assert_eq!(txt.class, "IN");
        assert!(txt.fallthrough);
        assert_eq!(
            txt.answer,
            vec![RecordSpec::Template(r#"{{ .Name }} IN TXT "hit""#.to_string())]
        );

        let addresses = &config.rules[1];
        assert_eq!(addresses.record_type, "ANY");
        assert_eq!(
            addresses.answer,
            vec![
                RecordSpec::Static {
                    address: "10.0.0.1".to_string(),
                    ttl: Some(120)
                },
                RecordSpec::Static {
                    address: "fd00::1".to_string(),
                    ttl: None
                },
            ]
        );
    }

    #[test]
    fn test_policy_defaults_to_highest_priority() {
        let config = load("[dns]\nlisten_addr = \"127.0.0.1:53\"\n");
        assert_eq!(config.dns.policy, ResolutionPolicy::HighestPriority);
        assert!(config.rules.is_empty());
        assert!(config.telemetry.opentelemetry.is_none());
    }

    #[test]
    fn test_opentelemetry_section() {
        let config = load(
            "[dns]\nlisten_addr = \"127.0.0.1:53\"\n\n[telemetry.opentelemetry]\nendpoint = \"http://localhost:4317\"\n",
        );
        let otel = config.telemetry.opentelemetry.unwrap();
        assert_eq!(otel.endpoint, "http://localhost:4317");
        assert_eq!(otel.service_name, "template-dns");
    }
}
