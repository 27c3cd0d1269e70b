//! Rule model and the table that binds pattern ids to rules.

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use hickory_proto::rr::{DNSClass, RecordType};
use tracing::{debug, info};

use crate::config::{RecordSpec, ResolutionPolicy, RuleConfig};
use crate::error::{ConfigError, ResolveError};
use crate::metrics;
use crate::pattern::{normalize_name, Pattern, PatternId, PatternIndexBuilder};
use crate::render::{Renderer, Section};
use crate::resolver::Resolver;
use crate::template::{FunctionTable, Template, TemplateError};

/// TTL used for static entries that do not set one.
pub const DEFAULT_TTL: u32 = 60;

/// Largest TTL accepted in configuration.
pub const MAX_TTL: i64 = 2_147_483_647;

/// Rule precedence, most specific last so that `Ord` puts the winner on top.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    /// `keyword:` patterns.
    Substring = 0,
    /// `regexp:` patterns.
    Regex = 1,
    /// `domain:` patterns.
    Domain = 2,
    /// `subdomain:` patterns.
    Subdomain = 3,
    /// Exact names.
    Full = 4,
}

impl Priority {
    /// Priority for a pattern, given whether the apex is excluded.
    pub fn of(pattern: &Pattern, subdomain_only: bool) -> Self {
        match pattern {
            Pattern::Full(_) => Priority::Full,
            Pattern::Domain(_) if subdomain_only => Priority::Subdomain,
            Pattern::Domain(_) => Priority::Domain,
            Pattern::Regex(_) => Priority::Regex,
            Pattern::Substring(_) => Priority::Substring,
        }
    }
}

/// Parse a configured pattern string with its optional kind prefix.
///
/// Returns the pattern and, for `subdomain:`, the apex to exclude.
pub fn parse_pattern(spec: &str) -> (Pattern, Option<String>) {
    if let Some(rest) = spec.strip_prefix("regexp:") {
        (Pattern::Regex(rest.to_string()), None)
    } else if let Some(rest) = spec.strip_prefix("keyword:") {
        (Pattern::Substring(rest.to_string()), None)
    } else if let Some(rest) = spec.strip_prefix("domain:") {
        (Pattern::Domain(rest.to_string()), None)
    } else if let Some(rest) = spec.strip_prefix("subdomain:") {
        let apex = normalize_name(rest.trim_start_matches('.'));
        (Pattern::Domain(rest.to_string()), Some(apex))
    } else {
        (Pattern::Full(spec.to_string()), None)
    }
}

/// A static address answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticAddress {
    /// Address to answer with. IPv4-mapped IPv6 addresses are stored as IPv4.
    pub address: IpAddr,
    /// Record TTL.
    pub ttl: u32,
}

impl StaticAddress {
    /// Record type this entry produces.
    pub fn record_type(&self) -> RecordType {
        match self.address {
            IpAddr::V4(_) => RecordType::A,
            IpAddr::V6(_) => RecordType::AAAA,
        }
    }
}

/// One configured record slot.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordTemplate {
    /// Pre-parsed address and TTL.
    Static(StaticAddress),
    /// Master-file line template.
    Text(Template),
}

/// The payload bound to a pattern.
#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    /// Pattern the rule was registered with.
    pub pattern: Pattern,
    /// Class filter; `ANY` matches every class.
    pub query_class: DNSClass,
    /// Type filter; `ANY` matches every type.
    pub query_type: RecordType,
    /// Precedence among matching rules.
    pub priority: Priority,
    /// Apex name this rule must not answer for.
    pub subdomain_exclusion: Option<String>,
    /// Keep collecting lower rules after this one (accumulate policy only).
    pub fallthrough: bool,
    /// Answer section templates.
    pub answer: Vec<RecordTemplate>,
    /// Additional section templates.
    pub additional: Vec<RecordTemplate>,
    /// Authority section templates.
    pub authority: Vec<RecordTemplate>,
    /// Position in the configuration, for diagnostics.
    pub position: usize,
}

impl Rule {
    /// Templates for a section, in configured order.
    pub fn section(&self, section: Section) -> &[RecordTemplate] {
        match section {
            Section::Answer => &self.answer,
            Section::Additional => &self.additional,
            Section::Authority => &self.authority,
        }
    }

    /// All text templates of this rule with their section.
    pub fn templates(&self) -> impl Iterator<Item = (Section, &Template)> {
        Section::ALL.into_iter().flat_map(move |section| {
            self.section(section).iter().filter_map(move |t| match t {
                RecordTemplate::Text(template) => Some((section, template)),
                RecordTemplate::Static(_) => None,
            })
        })
    }

    /// Whether this rule's class filter accepts `class`.
    pub fn accepts_class(&self, class: DNSClass) -> bool {
        self.query_class == DNSClass::ANY || class == DNSClass::ANY || class == self.query_class
    }

    /// Whether this rule's type filter accepts `rtype`.
    pub fn accepts_type(&self, rtype: RecordType) -> bool {
        self.query_type == RecordType::ANY || rtype == RecordType::ANY || rtype == self.query_type
    }

    /// True when `name` is the excluded apex.
    pub fn excludes(&self, name: &str) -> bool {
        self.subdomain_exclusion.as_deref() == Some(name)
    }

    /// True when two rules would compete with the same priority.
    fn overlaps(&self, other: &Rule) -> bool {
        self.pattern.kind() == other.pattern.kind()
            && self.pattern.key() == other.pattern.key()
            && self.subdomain_exclusion == other.subdomain_exclusion
            && (self.query_class == DNSClass::ANY
                || other.query_class == DNSClass::ANY
                || self.query_class == other.query_class)
            && (self.query_type == RecordType::ANY
                || other.query_type == RecordType::ANY
                || self.query_type == other.query_type)
    }
}

/// Pattern id → rule. Built once and read-only afterwards.
#[derive(Debug, Default)]
pub struct RuleTable {
    rules: HashMap<PatternId, Rule>,
}

impl RuleTable {
    /// Register `rule` under a new id from `index`.
    pub fn insert(&mut self, index: &mut PatternIndexBuilder, rule: Rule) -> PatternId {
        let id = index.register(rule.pattern.clone());
        self.rules.insert(id, rule);
        id
    }

    /// Look up a rule. An unknown id is an internal fault.
    pub fn get(&self, id: PatternId) -> Result<&Rule, ResolveError> {
        self.rules.get(&id).ok_or(ResolveError::MissingRule(id))
    }

    /// Number of rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// True if the table is empty.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

fn parse_class(rule: usize, token: &str) -> Result<DNSClass, ConfigError> {
    match token.to_ascii_uppercase().as_str() {
        "*" => Ok(DNSClass::ANY),
        upper => DNSClass::from_str(upper).map_err(|_| ConfigError::UnknownClass {
            rule,
            token: token.to_string(),
        }),
    }
}

fn parse_type(rule: usize, token: &str) -> Result<RecordType, ConfigError> {
    match token.to_ascii_uppercase().as_str() {
        "*" => Ok(RecordType::ANY),
        upper => RecordType::from_str(upper).map_err(|_| ConfigError::UnknownType {
            rule,
            token: token.to_string(),
        }),
    }
}

fn compile_records(
    rule: usize,
    section: Section,
    specs: &[RecordSpec],
) -> Result<Vec<RecordTemplate>, ConfigError> {
    specs
        .iter()
        .map(|spec| match spec {
            RecordSpec::Template(text) => Template::parse(text)
                .map(RecordTemplate::Text)
                .map_err(|source| ConfigError::Template {
                    rule,
                    section,
                    source,
                }),
            RecordSpec::Static { address, ttl } => {
                let ttl = match ttl {
                    None => DEFAULT_TTL,
                    Some(ttl) if (0..=MAX_TTL).contains(ttl) => *ttl as u32,
                    Some(ttl) => return Err(ConfigError::InvalidTtl { rule, ttl: *ttl }),
                };
                let address = address
                    .parse::<IpAddr>()
                    .map_err(|_| ConfigError::InvalidAddress {
                        rule,
                        address: address.clone(),
                    })?;
                let address = match address {
                    IpAddr::V6(v6) => v6
                        .to_ipv4_mapped()
                        .map(IpAddr::V4)
                        .unwrap_or(IpAddr::V6(v6)),
                    v4 => v4,
                };
                Ok(RecordTemplate::Static(StaticAddress { address, ttl }))
            }
        })
        .collect()
}

/// Compile one configured rule.
pub fn compile_rule(position: usize, config: &RuleConfig) -> Result<Rule, ConfigError> {
    let (pattern, subdomain_exclusion) = parse_pattern(&config.pattern);
    if pattern.key().is_empty() {
        return Err(ConfigError::EmptyPattern {
            rule: position,
            pattern: config.pattern.clone(),
        });
    }

    let priority = Priority::of(&pattern, subdomain_exclusion.is_some());
    Ok(Rule {
        query_class: parse_class(position, &config.class)?,
        query_type: parse_type(position, &config.record_type)?,
        priority,
        subdomain_exclusion,
        fallthrough: config.fallthrough,
        answer: compile_records(position, Section::Answer, &config.answer)?,
        additional: compile_records(position, Section::Additional, &config.additional)?,
        authority: compile_records(position, Section::Authority, &config.authority)?,
        pattern,
        position,
    })
}

/// Build the resolver and renderer from configuration.
///
/// Every template is checked against `functions`, so a configuration that
/// calls an unknown function never starts serving.
pub fn build(
    rules: &[RuleConfig],
    policy: ResolutionPolicy,
    functions: FunctionTable,
) -> Result<(Resolver, Renderer), ConfigError> {
    let mut index = PatternIndexBuilder::new();
    let mut table = RuleTable::default();
    let mut kinds: HashMap<&'static str, usize> = HashMap::new();
    let mut compiled: Vec<Rule> = Vec::with_capacity(rules.len());

    for (position, config) in rules.iter().enumerate() {
        let rule = compile_rule(position, config)?;

        for (section, template) in rule.templates() {
            if let Some(name) = template
                .function_names()
                .into_iter()
                .find(|name| !functions.contains(name))
            {
                return Err(ConfigError::Template {
                    rule: position,
                    section,
                    source: TemplateError::UnknownFunction(name.to_string()),
                });
            }
        }

        if policy == ResolutionPolicy::HighestPriority {
            if let Some(earlier) = compiled.iter().find(|earlier| earlier.overlaps(&rule)) {
                return Err(ConfigError::AmbiguousRule {
                    pattern: rule.pattern.to_string(),
                    first: earlier.position,
                    second: position,
                });
            }
        }

        *kinds.entry(rule.pattern.kind()).or_default() += 1;
        compiled.push(rule);
    }

    for rule in compiled {
        let id = table.insert(&mut index, rule);
        debug!(%id, "registered rule");
    }

    let index = index.build()?;
    for (kind, count) in &kinds {
        metrics::record_rule_count(kind, *count);
    }
    info!(rules = table.len(), policy = %policy, "rule table built");

    Ok((
        Resolver::new(index, table, policy),
        Renderer::new(functions),
    ))
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule_config(pattern: &str) -> RuleConfig {
        RuleConfig {
            pattern: pattern.to_string(),
            ..RuleConfig::default()
        }
    }

    fn static_entry(address: &str, ttl: Option<i64>) -> RecordSpec {
        RecordSpec::Static {
            address: address.to_string(),
            ttl,
        }
    }

    #[test]
    fn test_priority_is_a_total_order_over_kinds() {
        assert!(Priority::Full > Priority::Subdomain);
        assert!(Priority::Subdomain > Priority::Domain);
        assert!(Priority::Domain > Priority::Regex);
        assert!(Priority::Regex > Priority::Substring);
        assert_eq!(Priority::Full as u8, 4);
        assert_eq!(Priority::Substring as u8, 0);
    }

    #[test]
    fn test_parse_pattern_prefixes() {
        assert_eq!(
            parse_pattern("regexp:^a+$"),
            (Pattern::Regex("^a+$".into()), None)
        );
        assert_eq!(
            parse_pattern("keyword:ads"),
            (Pattern::Substring("ads".into()), None)
        );
        assert_eq!(
            parse_pattern("domain:example.org"),
            (Pattern::Domain("example.org".into()), None)
        );
        assert_eq!(
            parse_pattern("subdomain:Example.org."),
            (
                Pattern::Domain("Example.org.".into()),
                Some("example.org".into())
            )
        );
        assert_eq!(
            parse_pattern("www.example.org"),
            (Pattern::Full("www.example.org".into()), None)
        );
    }

    #[test]
    fn test_compile_rule_priorities() {
        let cases = [
            ("example.org", Priority::Full),
            ("subdomain:example.org", Priority::Subdomain),
            ("domain:example.org", Priority::Domain),
            ("regexp:example", Priority::Regex),
            ("keyword:example", Priority::Substring),
        ];
        for (pattern, priority) in cases {
            assert_eq!(compile_rule(0, &rule_config(pattern)).unwrap().priority, priority);
        }
    }

    #[test]
    fn test_static_ttl_bounds() {
        let mut config = rule_config("example.org");
        config.answer = vec![static_entry("10.0.0.1", Some(MAX_TTL))];
        let rule = compile_rule(0, &config).unwrap();
        assert_eq!(
            rule.answer,
            vec![RecordTemplate::Static(StaticAddress {
                address: "10.0.0.1".parse().unwrap(),
                ttl: 2_147_483_647,
            })]
        );

        config.answer = vec![static_entry("10.0.0.1", Some(MAX_TTL + 1))];
        assert!(matches!(
            compile_rule(3, &config),
            Err(ConfigError::InvalidTtl { rule: 3, ttl: 2_147_483_648 })
        ));

        config.answer = vec![static_entry("10.0.0.1", Some(-1))];
        assert!(matches!(
            compile_rule(0, &config),
            Err(ConfigError::InvalidTtl { .. })
        ));
    }

    #[test]
    fn test_static_default_ttl_and_mapped_address() {
        let mut config = rule_config("example.org");
        config.answer = vec![static_entry("::ffff:10.0.0.1", None), static_entry("fd00::1", None)];
        let rule = compile_rule(0, &config).unwrap();
        let types: Vec<_> = rule
            .answer
            .iter()
            .map(|t| match t {
                RecordTemplate::Static(s) => (s.record_type(), s.ttl),
                RecordTemplate::Text(_) => panic!("expected static entry"),
            })
            .collect();
        assert_eq!(
            types,
            vec![(RecordType::A, DEFAULT_TTL), (RecordType::AAAA, DEFAULT_TTL)]
        );
    }

    #[test]
    fn test_config_errors() {
        let mut config = rule_config("example.org");
        config.answer = vec![static_entry("not-an-ip", None)];
        assert!(matches!(
            compile_rule(0, &config),
            Err(ConfigError::InvalidAddress { .. })
        ));

        let mut config = rule_config("example.org");
        config.class = "BOGUS".to_string();
        assert!(matches!(
            compile_rule(0, &config),
            Err(ConfigError::UnknownClass { .. })
        ));

        let mut config = rule_config("example.org");
        config.record_type = "NOPE".to_string();
        assert!(matches!(
            compile_rule(0, &config),
            Err(ConfigError::UnknownType { .. })
        ));

        let mut config = rule_config("example.org");
        config.answer = vec![RecordSpec::Template("{{ .Name".to_string())];
        assert!(matches!(
            compile_rule(0, &config),
            Err(ConfigError::Template {
                section: Section::Answer,
                ..
            })
        ));

        assert!(matches!(
            compile_rule(0, &rule_config("keyword:")),
            Err(ConfigError::EmptyPattern { .. })
        ));
    }

    #[test]
    fn test_single_dot_is_a_pattern_outside_domains() {
        for pattern in ["regexp:.", "keyword:."] {
            let rule = compile_rule(0, &rule_config(pattern)).unwrap();
            assert_eq!(rule.pattern.text(), ".");
        }

        for pattern in ["domain:.", "subdomain:..", "."] {
            assert!(
                matches!(
                    compile_rule(0, &rule_config(pattern)),
                    Err(ConfigError::EmptyPattern { .. })
                ),
                "{pattern} should be empty"
            );
        }
    }

    #[test]
    fn test_class_and_type_wildcards() {
        let mut config = rule_config("example.org");
        config.class = "*".to_string();
        config.record_type = "any".to_string();
        let rule = compile_rule(0, &config).unwrap();
        assert_eq!(rule.query_class, DNSClass::ANY);
        assert_eq!(rule.query_type, RecordType::ANY);
        assert!(rule.accepts_class(DNSClass::CH));
        assert!(rule.accepts_type(RecordType::MX));
    }

    #[test]
    fn test_build_rejects_ambiguous_rules() {
        let mut a = rule_config("example.org");
        a.record_type = "A".to_string();
        let b = rule_config("example.org");
        let err = build(
            &[a.clone(), b],
            ResolutionPolicy::HighestPriority,
            FunctionTable::with_builtins(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::AmbiguousRule {
                first: 0,
                second: 1,
                ..
            }
        ));

        // Disjoint types are fine.
        let mut c = rule_config("example.org");
        c.record_type = "AAAA".to_string();
        assert!(build(
            &[a.clone(), c],
            ResolutionPolicy::HighestPriority,
            FunctionTable::with_builtins()
        )
        .is_ok());

        // Spelling differences that match the same names still collide.
        for (first, second) in [
            ("Example.org", "example.org"),
            ("example.org.", "example.org"),
            ("domain:example.org", "domain:example.org."),
            ("domain:.Example.org", "domain:example.org"),
            ("keyword:Ads", "keyword:ads"),
        ] {
            let result = build(
                &[rule_config(first), rule_config(second)],
                ResolutionPolicy::HighestPriority,
                FunctionTable::with_builtins(),
            );
            assert!(
                matches!(result, Err(ConfigError::AmbiguousRule { first: 0, second: 1, .. })),
                "{first} and {second} should collide"
            );
        }

        // Same text under different kinds is not a tie.
        assert!(build(
            &[rule_config("domain:example.org"), rule_config("subdomain:example.org")],
            ResolutionPolicy::HighestPriority,
            FunctionTable::with_builtins()
        )
        .is_ok());

        // Accumulating duplicates is intentional.
        assert!(build(
            &[a.clone(), a],
            ResolutionPolicy::Accumulate,
            FunctionTable::with_builtins()
        )
        .is_ok());
    }

    #[test]
    fn test_build_rejects_unknown_functions() {
        let mut config = rule_config("example.org");
        config.additional = vec![RecordSpec::Template(
            "{{ .Name }} IN TXT {{ shout .Name }}".to_string(),
        )];
        let err = build(
            &[config],
            ResolutionPolicy::HighestPriority,
            FunctionTable::with_builtins(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Template {
                rule: 0,
                section: Section::Additional,
                source: TemplateError::UnknownFunction(_),
            }
        ));
    }

    #[test]
    fn test_rule_table_missing_id() {
        let mut index = PatternIndexBuilder::new();
        let mut table = RuleTable::default();
        let id = table.insert(&mut index, compile_rule(0, &rule_config("a.example")).unwrap());
        assert!(table.get(id).is_ok());

        let stray = index.register(Pattern::Full("b.example".into()));
        assert!(matches!(table.get(stray), Err(ResolveError::MissingRule(_))));
    }
}
