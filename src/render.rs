//! Record rendering.
//!
//! A winning [`Rule`] plus the per-request [`QueryContext`] become three
//! ordered record lists. Static entries turn into A/AAAA records directly;
//! text templates are executed and the resulting master-file line is parsed
//! with hickory's zone-file parser.

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use hickory_proto::op::{Message, Query};
use hickory_proto::rr::rdata::{A, AAAA};
use hickory_proto::rr::{DNSClass, Name, RData, Record, RecordType};
use hickory_proto::serialize::txt::Parser;
use tracing::{trace, warn};

use crate::error::RenderError;
use crate::metrics;
use crate::resolver::RuleQuery;
use crate::rules::{RecordTemplate, Rule, StaticAddress};
use crate::template::{FunctionTable, Scope, Template, TemplateError, Value};

/// TTL for template lines that do not carry one.
pub const TEMPLATE_DEFAULT_TTL: u32 = 3600;

/// Response section a record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Section {
    /// Answer section.
    Answer,
    /// Additional section.
    Additional,
    /// Authority section.
    Authority,
}

impl Section {
    /// Rendering order.
    pub const ALL: [Section; 3] = [Section::Answer, Section::Additional, Section::Authority];

    /// Lowercase name as used in configuration.
    pub fn as_str(&self) -> &'static str {
        match self {
            Section::Answer => "answer",
            Section::Additional => "additional",
            Section::Authority => "authority",
        }
    }
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rendered records, one list per section.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Sections {
    /// Answer records.
    pub answers: Vec<Record>,
    /// Additional records.
    pub additionals: Vec<Record>,
    /// Authority records.
    pub authorities: Vec<Record>,
}

impl Sections {
    /// Append a record to `section`.
    pub fn push(&mut self, section: Section, record: Record) {
        match section {
            Section::Answer => self.answers.push(record),
            Section::Additional => self.additionals.push(record),
            Section::Authority => self.authorities.push(record),
        }
    }

    /// Append all records of `other`, keeping order.
    pub fn extend(&mut self, other: Sections) {
        self.answers.extend(other.answers);
        self.additionals.extend(other.additionals);
        self.authorities.extend(other.authorities);
    }

    /// Total record count.
    pub fn len(&self) -> usize {
        self.answers.len() + self.additionals.len() + self.authorities.len()
    }

    /// True if no section holds a record.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A zero-argument metadata value producer.
pub type MetadataProvider = Arc<dyn Fn() -> String + Send + Sync>;

/// Named metadata providers available to templates through `.Meta "name"`.
pub type Metadata = HashMap<String, MetadataProvider>;

/// Everything rendering may look at for one request.
#[derive(Clone)]
pub struct QueryContext {
    /// Normalized name, class and type.
    pub query: RuleQuery,
    /// The question as received.
    pub question: Query,
    /// The query message (header and question).
    pub message: Message,
    /// Client address.
    pub remote: SocketAddr,
    /// Request-scoped metadata providers.
    pub metadata: Metadata,
}

impl fmt::Debug for QueryContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<_> = self.metadata.keys().collect();
        keys.sort();
        f.debug_struct("QueryContext")
            .field("query", &self.query)
            .field("question", &self.question)
            .field("remote", &self.remote)
            .field("metadata", &keys)
            .finish()
    }
}

impl QueryContext {
    /// Build a context for `question`, taking the header from `message`.
    pub fn new(question: Query, message: Message, remote: SocketAddr, metadata: Metadata) -> Self {
        Self {
            query: RuleQuery::from(&question),
            question,
            message,
            remote,
            metadata,
        }
    }

    /// Class the records are rendered for.
    fn effective_class(&self, rule: &Rule) -> DNSClass {
        match (self.query.query_class, rule.query_class) {
            (DNSClass::ANY, DNSClass::ANY) => DNSClass::IN,
            (DNSClass::ANY, class) => class,
            (class, _) => class,
        }
    }

    /// Type the records are rendered for.
    fn effective_type(&self, rule: &Rule) -> RecordType {
        match self.query.query_type {
            RecordType::ANY => rule.query_type,
            rtype => rtype,
        }
    }
}

/// Template view of a [`QueryContext`] for one rule.
struct TemplateData<'a> {
    ctx: &'a QueryContext,
    name: String,
    class: String,
    rtype: String,
}

impl<'a> TemplateData<'a> {
    fn new(ctx: &'a QueryContext, rule: &Rule) -> Self {
        Self {
            ctx,
            name: format!("{}.", ctx.query.name),
            class: ctx.effective_class(rule).to_string(),
            rtype: ctx.effective_type(rule).to_string(),
        }
    }
}

impl Scope for TemplateData<'_> {
    fn field(&self, path: &[String]) -> Result<Value, TemplateError> {
        let path: Vec<&str> = path.iter().map(String::as_str).collect();
        let question = &self.ctx.question;
        let header = self.ctx.message.header();

        Ok(match path.as_slice() {
            [] | ["Name"] => Value::Str(self.name.clone()),
            ["Class"] => Value::Str(self.class.clone()),
            ["Type"] => Value::Str(self.rtype.clone()),
            ["Remote"] => Value::Str(self.ctx.remote.ip().to_string()),
            ["Question", "Name"] => Value::Str(question.name().to_ascii()),
            ["Question", "Qtype"] => Value::Uint(u16::from(question.query_type()).into()),
            ["Question", "Qclass"] => Value::Uint(u16::from(question.query_class()).into()),
            ["Question", "Type"] => Value::Str(question.query_type().to_string()),
            ["Question", "Class"] => Value::Str(question.query_class().to_string()),
            ["Message", "Id"] => Value::Uint(header.id().into()),
            ["Message", "Opcode"] => Value::Uint(u8::from(header.op_code()).into()),
            ["Message", "RecursionDesired"] => Value::Bool(header.recursion_desired()),
            ["Message", "CheckingDisabled"] => Value::Bool(header.checking_disabled()),
            ["Message", "AuthenticData"] => Value::Bool(header.authentic_data()),
            _ => return Err(TemplateError::UnknownField(path.join("."))),
        })
    }

    fn method(&self, path: &[String], args: &[Value]) -> Result<Value, TemplateError> {
        match (path, args) {
            ([name], [Value::Str(key)]) if name == "Meta" => Ok(self
                .ctx
                .metadata
                .get(key)
                .map(|provider| Value::Str(provider()))
                .unwrap_or(Value::Nil)),
            ([name], _) if name == "Meta" => Err(TemplateError::Call {
                name: "Meta".to_string(),
                message: "expects one string argument".to_string(),
            }),
            _ => Err(TemplateError::UnknownField(path.join("."))),
        }
    }
}

/// Turns rules into records.
#[derive(Debug, Clone, Default)]
pub struct Renderer {
    functions: FunctionTable,
}

impl Renderer {
    /// Create a renderer with the given template functions.
    pub fn new(functions: FunctionTable) -> Self {
        Self { functions }
    }

    /// Render every section of `rule` for `ctx`.
    ///
    /// Fails as a whole; no partial result is returned.
    pub fn render(&self, rule: &Rule, ctx: &QueryContext) -> Result<Sections, RenderError> {
        let data = TemplateData::new(ctx, rule);
        let class = ctx.effective_class(rule);
        let rtype = ctx.effective_type(rule);
        let mut sections = Sections::default();

        for section in Section::ALL {
            for slot in rule.section(section) {
                match slot {
                    RecordTemplate::Static(entry) => {
                        if let Some(record) = static_record(entry, &ctx.question, class, rtype) {
                            sections.push(section, record);
                        }
                    }
                    RecordTemplate::Text(template) => {
                        let record = self
                            .render_template(section, template, &data)
                            .inspect_err(|e| {
                                warn!(name = %ctx.query.name, error = %e, "template rendering failed");
                                metrics::record_render_failure(section.as_str());
                            })?;
                        sections.push(section, record);
                    }
                }
            }
        }

        trace!(name = %ctx.query.name, records = sections.len(), "rendered rule");
        Ok(sections)
    }

    /// Render several rules in order and concatenate their sections.
    pub fn render_all(&self, rules: &[&Rule], ctx: &QueryContext) -> Result<Sections, RenderError> {
        let mut sections = Sections::default();
        for rule in rules {
            sections.extend(self.render(rule, ctx)?);
        }
        Ok(sections)
    }

    fn render_template(
        &self,
        section: Section,
        template: &Template,
        data: &TemplateData<'_>,
    ) -> Result<Record, RenderError> {
        let line = template
            .execute(data, &self.functions)
            .map_err(|source| RenderError::TemplateExecution { section, source })?;
        parse_record(section, &line)
    }
}

/// A/AAAA record for a static entry, if it fits the rendered type.
fn static_record(
    entry: &StaticAddress,
    question: &Query,
    class: DNSClass,
    rtype: RecordType,
) -> Option<Record> {
    if rtype != RecordType::ANY && rtype != entry.record_type() {
        return None;
    }

    let rdata = match entry.address {
        IpAddr::V4(v4) => RData::A(A(v4)),
        IpAddr::V6(v6) => RData::AAAA(AAAA(v6)),
    };
    let mut record = Record::from_rdata(question.name().clone(), entry.ttl, rdata);
    record.set_dns_class(class);
    Some(record)
}

/// Parse one master-file record line.
pub fn parse_record(section: Section, line: &str) -> Result<Record, RenderError> {
    let syntax_error = |reason: String| RenderError::RecordSyntax {
        section,
        line: line.to_string(),
        reason,
    };

    let trimmed = line.trim();
    if trimmed.lines().any(|l| l.trim_start().starts_with('$')) {
        return Err(syntax_error("directives are not allowed".to_string()));
    }
    // The zone parser merges identical records, so count entries up front.
    if entry_count(trimmed) > 1 {
        return Err(syntax_error("more than one record produced".to_string()));
    }

    let input = format!("$TTL {TEMPLATE_DEFAULT_TTL}\n{trimmed}\n");
    let (_, records) = Parser::new(input, None, Some(Name::root()))
        .parse()
        .map_err(|e| syntax_error(e.to_string()))?;

    let mut records = records
        .into_values()
        .flat_map(|set| set.records_without_rrsigs().cloned().collect::<Vec<_>>());
    let record = records
        .next()
        .ok_or_else(|| syntax_error("no record produced".to_string()))?;
    if records.next().is_some() {
        return Err(syntax_error("more than one record produced".to_string()));
    }
    Ok(record)
}

/// Number of master-file entries in `text`. Lines inside parentheses
/// continue the entry that opened them.
fn entry_count(text: &str) -> usize {
    let mut depth = 0usize;
    let mut entries = 0;
    for line in text.lines() {
        let mut blank = true;
        let mut quoted = false;
        let mut escaped = false;
        let starts_entry = depth == 0;
        for c in line.chars() {
            if escaped {
                escaped = false;
                continue;
            }
            match c {
                '\\' => escaped = true,
                '"' => quoted = !quoted,
                ';' if !quoted => break,
                '(' if !quoted => depth += 1,
                ')' if !quoted => depth = depth.saturating_sub(1),
                _ => {}
            }
            if !c.is_whitespace() {
                blank = false;
            }
        }
        if starts_entry && !blank {
            entries += 1;
        }
    }
    entries
}
