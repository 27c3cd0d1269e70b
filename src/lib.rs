//! Template DNS - answers DNS queries from pattern-matched, templated rules.
//!
//! Each rule pairs a name pattern (exact, domain, subdomain, keyword or
//! regular expression) with class and type filters and a list of records to
//! return. Records are either static addresses or master-file lines written
//! in a small template language that can see the query, the request and
//! request metadata.
//!
//! ## Features
//!
//! - One-pass matching of all patterns per query
//! - Most-specific-rule selection, or accumulation with `fallthrough`
//! - Templated answer, additional and authority sections
//! - Pass-through to the next hickory handler when no rule applies
//! - Graceful shutdown support
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                         template-dns                          │
//! │                                                               │
//! │  UDP/TCP ──▶ TemplateHandler ──▶ Resolver ──▶ PatternIndex    │
//! │   :53            │                  │                         │
//! │                  │                  ▼                         │
//! │                  │             RuleTable                      │
//! │                  │                  │                         │
//! │                  │   matched rules  ▼                         │
//! │                  │             Renderer ──▶ Template          │
//! │                  │                                            │
//! │                  └── no match ──▶ next handler (Catalog)      │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Rule Selection
//!
//! ```text
//! www.example.org  TXT
//!   → every pattern matching the name, in one pass
//!   → drop rules whose class/type filter or subdomain exclusion rejects it
//!   → keep the most specific: exact > subdomain > domain > regexp > keyword
//!   → render its records; nothing left means pass-through
//! ```
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use template_dns::{DnsConfig, DnsServer, RecordSpec, RuleConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = DnsConfig {
//!         listen_addr: "[::]:5353".parse().unwrap(),
//!         tcp_timeout_secs: 30,
//!         policy: Default::default(),
//!     };
//!     let rules = vec![RuleConfig {
//!         pattern: "subdomain:example.org".to_string(),
//!         record_type: "TXT".to_string(),
//!         answer: vec![RecordSpec::Template(r#"{{ .Name }} 60 IN TXT "hit""#.to_string())],
//!         ..Default::default()
//!     }];
//!
//!     let shutdown = CancellationToken::new();
//!     let server = DnsServer::new(config, &rules).unwrap();
//!     server.run(shutdown).await.unwrap();
//! }
//! ```

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod handler;
pub mod metrics;
pub mod pattern;
pub mod render;
pub mod resolver;
pub mod rules;
pub mod server;
pub mod telemetry;
pub mod template;

// Re-export main types
pub use config::{
    Config, DnsConfig, OpenTelemetryConfig, RecordSpec, ResolutionPolicy, RuleConfig,
    TelemetryConfig,
};
pub use error::{ConfigError, DnsError, QueryError, RenderError, ResolveError};
pub use handler::{MetadataSource, NoMetadata, Outcome, RequestMetadata, TemplateHandler};
pub use pattern::{Pattern, PatternId, PatternIndex};
pub use render::{QueryContext, Renderer, Section, Sections};
pub use resolver::{Resolver, RuleQuery};
pub use rules::{Priority, Rule};
pub use server::DnsServer;
pub use template::{FunctionTable, Template, TemplateError, Value};
