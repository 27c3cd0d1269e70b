//! Hickory request handler that answers from rules or delegates.
//!
//! [`TemplateHandler`] sits in front of another [`RequestHandler`]. Queries
//! that no rule claims are passed to that next handler untouched; claimed
//! queries get an authoritative reply built from the rendered records, or
//! SERVFAIL if rendering fails.

use std::collections::HashMap;
use std::iter;
use std::sync::Arc;

use async_trait::async_trait;
use hickory_proto::op::{Header, Message, ResponseCode};
use hickory_server::authority::MessageResponseBuilder;
use hickory_server::server::{Request, RequestHandler, ResponseHandler, ResponseInfo};
use tracing::{debug, error, warn};

use crate::error::QueryError;
use crate::metrics::{self, QueryResult, Timer};
use crate::render::{Metadata, MetadataProvider, QueryContext, Renderer, Sections};
use crate::resolver::Resolver;

/// Supplies request-scoped metadata providers.
pub trait MetadataSource: Send + Sync + 'static {
    /// Providers for this request.
    fn providers(&self, request: &Request) -> Metadata;
}

/// Exposes facts about the request itself:
/// `request/ip`, `request/port`, `request/proto`, `request/id`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestMetadata;

impl MetadataSource for RequestMetadata {
    fn providers(&self, request: &Request) -> Metadata {
        let src = request.src();
        let protocol = request.protocol().to_string().to_ascii_lowercase();
        let id = request.header().id();

        let entries: [(&str, MetadataProvider); 4] = [
            ("request/ip", Arc::new(move || src.ip().to_string())),
            ("request/port", Arc::new(move || src.port().to_string())),
            ("request/proto", Arc::new(move || protocol.clone())),
            ("request/id", Arc::new(move || id.to_string())),
        ];
        entries
            .into_iter()
            .map(|(name, provider)| (name.to_string(), provider))
            .collect()
    }
}

/// Metadata source with no providers.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoMetadata;

impl MetadataSource for NoMetadata {
    fn providers(&self, _request: &Request) -> Metadata {
        HashMap::new()
    }
}

/// Result of handling one query in the core.
#[derive(Debug)]
pub enum Outcome {
    /// No rule claimed the query; ask the next handler.
    PassThrough,
    /// Rendered records to send.
    Answer(Sections),
    /// Resolution or rendering failed.
    Failure(QueryError),
}

impl Outcome {
    /// DNS response code for this outcome. `None` for pass-through, which
    /// is decided by the next handler.
    pub fn response_code(&self) -> Option<ResponseCode> {
        match self {
            Outcome::PassThrough => None,
            Outcome::Answer(_) => Some(ResponseCode::NoError),
            Outcome::Failure(_) => Some(ResponseCode::ServFail),
        }
    }
}

/// Rule-backed handler chained in front of `N`.
pub struct TemplateHandler<N> {
    resolver: Arc<Resolver>,
    renderer: Arc<Renderer>,
    metadata: Arc<dyn MetadataSource>,
    next: N,
}

impl<N> TemplateHandler<N> {
    /// Create a handler that delegates unmatched queries to `next`.
    pub fn new(resolver: Resolver, renderer: Renderer, next: N) -> Self {
        Self {
            resolver: Arc::new(resolver),
            renderer: Arc::new(renderer),
            metadata: Arc::new(RequestMetadata),
            next,
        }
    }

    /// Replace the metadata source.
    pub fn with_metadata(mut self, metadata: impl MetadataSource) -> Self {
        self.metadata = Arc::new(metadata);
        self
    }

    /// The resolver in use.
    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    /// Resolve and render one query. Pure apart from logging and metrics.
    pub fn handle(&self, ctx: &QueryContext) -> Outcome {
        let rules = match self.resolver.select(&ctx.query) {
            Ok(rules) => rules,
            Err(e) => {
                error!(name = %ctx.query.name, error = %e, "rule lookup failed");
                return Outcome::Failure(e.into());
            }
        };
        if rules.is_empty() {
            return Outcome::PassThrough;
        }

        match self.renderer.render_all(&rules, ctx) {
            Ok(sections) => Outcome::Answer(sections),
            Err(e) => Outcome::Failure(e.into()),
        }
    }
}

impl<N: RequestHandler> TemplateHandler<N> {
    async fn send_sections<R: ResponseHandler>(
        &self,
        request: &Request,
        sections: &Sections,
        mut response_handle: R,
    ) -> ResponseInfo {
        let builder = MessageResponseBuilder::from_message_request(request);
        let mut header = Header::response_from_request(request.header());
        header.set_authoritative(true);
        header.set_recursion_available(true);

        let response = builder.build(
            header,
            sections.answers.iter(),
            sections.authorities.iter(),
            iter::empty(),
            sections.additionals.iter(),
        );
        match response_handle.send_response(response).await {
            Ok(info) => info,
            Err(e) => {
                error!(error = %e, "failed to send response");
                servfail_info()
            }
        }
    }

    async fn send_error<R: ResponseHandler>(
        &self,
        request: &Request,
        code: ResponseCode,
        mut response_handle: R,
    ) -> ResponseInfo {
        let builder = MessageResponseBuilder::from_message_request(request);
        let response = builder.error_msg(request.header(), code);
        match response_handle.send_response(response).await {
            Ok(info) => info,
            Err(e) => {
                error!(error = %e, "failed to send error response");
                servfail_info()
            }
        }
    }
}

fn servfail_info() -> ResponseInfo {
    let mut header = Header::new();
    header.set_response_code(ResponseCode::ServFail);
    header.into()
}

#[async_trait]
impl<N: RequestHandler> RequestHandler for TemplateHandler<N> {
    async fn handle_request<R: ResponseHandler>(
        &self,
        request: &Request,
        response_handle: R,
    ) -> ResponseInfo {
        let timer = Timer::start();

        let info = match request.request_info() {
            Ok(info) => info,
            Err(e) => {
                warn!(error = %e, src = %request.src(), "malformed request");
                return self
                    .send_error(request, ResponseCode::FormErr, response_handle)
                    .await;
            }
        };
        let question = info.query.original().clone();
        let rtype = question.query_type().to_string();

        let mut message = Message::new();
        message.set_header(*request.header());
        message.add_query(question.clone());

        let ctx = QueryContext::new(
            question,
            message,
            request.src(),
            self.metadata.providers(request),
        );

        match self.handle(&ctx) {
            Outcome::PassThrough => {
                debug!(name = %ctx.query.name, "no rule matched, passing through");
                metrics::record_query(&rtype, QueryResult::PassThrough, timer.elapsed());
                self.next.handle_request(request, response_handle).await
            }
            Outcome::Answer(sections) => {
                debug!(name = %ctx.query.name, records = sections.len(), "answering from rules");
                metrics::record_records_returned(sections.len());
                metrics::record_query(&rtype, QueryResult::Answered, timer.elapsed());
                self.send_sections(request, &sections, response_handle).await
            }
            Outcome::Failure(e) => {
                error!(name = %ctx.query.name, error = %e, "query failed");
                metrics::record_query(&rtype, QueryResult::ServFail, timer.elapsed());
                self.send_error(request, ResponseCode::ServFail, response_handle)
                    .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RecordSpec, ResolutionPolicy, RuleConfig};
    use crate::rules;
    use crate::template::FunctionTable;
    use hickory_proto::op::Query;
    use hickory_proto::rr::{DNSClass, Name, RecordType};

    fn handler(configs: &[RuleConfig], policy: ResolutionPolicy) -> TemplateHandler<()> {
        let (resolver, renderer) =
            rules::build(configs, policy, FunctionTable::with_builtins()).unwrap();
        TemplateHandler::new(resolver, renderer, ())
    }

    fn context(name: &str, rtype: RecordType) -> QueryContext {
        let mut question = Query::query(Name::from_ascii(name).unwrap(), rtype);
        question.set_query_class(DNSClass::IN);
        let mut message = Message::new();
        message.add_query(question.clone());
        QueryContext::new(question, message, "10.1.1.1:53000".parse().unwrap(), HashMap::new())
    }

    fn txt_rule(pattern: &str, text: &str) -> RuleConfig {
        RuleConfig {
            pattern: pattern.to_string(),
            answer: vec![RecordSpec::Template(text.to_string())],
            ..RuleConfig::default()
        }
    }

    #[test]
    fn test_unmatched_query_passes_through() {
        let handler = handler(
            &[txt_rule("domain:example.org", r#"{{ .Name }} IN TXT "x""#)],
            ResolutionPolicy::HighestPriority,
        );
        let outcome = handler.handle(&context("example.net.", RecordType::TXT));
        assert!(matches!(outcome, Outcome::PassThrough));
        assert_eq!(outcome.response_code(), None);
    }

    #[test]
    fn test_render_failure_is_servfail() {
        let handler = handler(
            &[txt_rule("domain:example.org", "{{ .Name }} IN A {{ .Remote }}x")],
            ResolutionPolicy::HighestPriority,
        );
        let outcome = handler.handle(&context("example.org.", RecordType::A));
        assert!(matches!(outcome, Outcome::Failure(QueryError::Render(_))));
        assert_eq!(outcome.response_code(), Some(ResponseCode::ServFail));
    }

    #[test]
    fn test_accumulated_rules_concatenate_sections() {
        let mut first = txt_rule("domain:example.org", r#"{{ .Name }} IN TXT "domain""#);
        first.fallthrough = true;
        let second = txt_rule("keyword:example", r#"{{ .Name }} IN TXT "keyword""#);
        let handler = handler(&[first, second], ResolutionPolicy::Accumulate);

        match handler.handle(&context("www.example.org.", RecordType::TXT)) {
            Outcome::Answer(sections) => assert_eq!(sections.answers.len(), 2),
            other => panic!("expected answer, got {other:?}"),
        }
    }
}
