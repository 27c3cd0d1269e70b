//! Error types for template-dns.

use thiserror::Error;

use crate::pattern::PatternId;
use crate::render::Section;
use crate::template::TemplateError;

/// Errors that can occur while loading configuration or running the server.
#[derive(Debug, Error)]
pub enum DnsError {
    /// IO error (network, file, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file could not be read or deserialized
    #[error("Configuration load error: {0}")]
    Load(#[from] config::ConfigError),

    /// Rule configuration is invalid
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// DNS protocol error
    #[error("DNS protocol error: {0}")]
    Proto(#[from] hickory_proto::ProtoError),
}

/// Build-time errors. Any of these prevents the server from starting.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A pattern had no text after its kind prefix.
    #[error("rule {rule}: empty pattern {pattern:?}")]
    EmptyPattern {
        /// Position of the rule in the configuration.
        rule: usize,
        /// Pattern as written.
        pattern: String,
    },

    /// A `regexp:` pattern failed to compile.
    #[error("invalid regular expression {pattern:?}: {source}")]
    InvalidRegex {
        /// Regex source.
        pattern: String,
        /// Underlying compile error.
        #[source]
        source: regex::Error,
    },

    /// The substring automaton could not be built.
    #[error("failed to build keyword matcher: {0}")]
    Automaton(#[from] aho_corasick::BuildError),

    /// TTL outside of `[0, 2147483647]`.
    #[error("rule {rule}: invalid TTL {ttl}, must be between 0 and 2147483647")]
    InvalidTtl {
        /// Position of the rule in the configuration.
        rule: usize,
        /// Configured TTL.
        ttl: i64,
    },

    /// A static entry was not an IP address.
    #[error("rule {rule}: invalid address {address:?}")]
    InvalidAddress {
        /// Position of the rule in the configuration.
        rule: usize,
        /// Configured address.
        address: String,
    },

    /// Unknown DNS class token.
    #[error("rule {rule}: unknown class {token:?}")]
    UnknownClass {
        /// Position of the rule in the configuration.
        rule: usize,
        /// Token as written.
        token: String,
    },

    /// Unknown DNS record type token.
    #[error("rule {rule}: unknown type {token:?}")]
    UnknownType {
        /// Position of the rule in the configuration.
        rule: usize,
        /// Token as written.
        token: String,
    },

    /// A template failed to parse.
    #[error("rule {rule}: malformed {section} template: {source}")]
    Template {
        /// Position of the rule in the configuration.
        rule: usize,
        /// Section the template belongs to.
        section: Section,
        /// Parse error.
        #[source]
        source: TemplateError,
    },

    /// Two rules would compete for the same names with the same priority.
    #[error("rules {first} and {second} both match {pattern:?} with overlapping class and type")]
    AmbiguousRule {
        /// Pattern shared by both rules.
        pattern: String,
        /// Position of the first rule.
        first: usize,
        /// Position of the second rule.
        second: usize,
    },
}

/// Internal-consistency faults raised while resolving a query.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// The pattern index returned an id with no rule behind it.
    #[error("no rule registered for pattern {0}")]
    MissingRule(PatternId),
}

/// Per-request rendering failures. The whole response is abandoned.
#[derive(Debug, Error)]
pub enum RenderError {
    /// Template execution failed.
    #[error("{section} template execution failed: {source}")]
    TemplateExecution {
        /// Section being rendered.
        section: Section,
        /// Execution error.
        #[source]
        source: TemplateError,
    },

    /// Rendered text is not a single valid resource record.
    #[error("{section} template produced an invalid record {line:?}: {reason}")]
    RecordSyntax {
        /// Section being rendered.
        section: Section,
        /// Rendered text.
        line: String,
        /// Why it was rejected.
        reason: String,
    },
}

/// Any failure that turns a matched query into SERVFAIL.
#[derive(Debug, Error)]
pub enum QueryError {
    /// Resolution fault.
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    /// Rendering fault.
    #[error(transparent)]
    Render(#[from] RenderError),
}
