//! Rule selection.
//!
//! Given a query, find every rule whose pattern matches, drop the ones whose
//! class, type or apex exclusion rules them out, and pick the winner(s)
//! according to the configured [`ResolutionPolicy`].

use hickory_proto::op::Query;
use hickory_proto::rr::{DNSClass, RecordType};
use tracing::{debug, trace};

use crate::config::ResolutionPolicy;
use crate::error::ResolveError;
use crate::pattern::{normalize_name, PatternId, PatternIndex};
use crate::rules::{Rule, RuleTable};

/// The part of a question the resolver looks at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleQuery {
    /// Normalized name (lowercase, no trailing dot).
    pub name: String,
    /// Question class.
    pub query_class: DNSClass,
    /// Question type.
    pub query_type: RecordType,
}

impl RuleQuery {
    /// Build a query, normalizing `name`.
    pub fn new(name: &str, query_class: DNSClass, query_type: RecordType) -> Self {
        Self {
            name: normalize_name(name),
            query_class,
            query_type,
        }
    }
}

impl From<&Query> for RuleQuery {
    fn from(query: &Query) -> Self {
        Self::new(
            &query.name().to_ascii(),
            query.query_class(),
            query.query_type(),
        )
    }
}

/// Selects rules for queries. Immutable once built.
#[derive(Debug)]
pub struct Resolver {
    index: PatternIndex,
    table: RuleTable,
    policy: ResolutionPolicy,
}

impl Resolver {
    /// Wrap a built index and its rule table.
    pub fn new(index: PatternIndex, table: RuleTable, policy: ResolutionPolicy) -> Self {
        Self {
            index,
            table,
            policy,
        }
    }

    /// Configured selection policy.
    pub fn policy(&self) -> ResolutionPolicy {
        self.policy
    }

    /// Number of loaded rules.
    pub fn rule_count(&self) -> usize {
        self.table.len()
    }

    /// Rules that survive class, type and apex filtering, in id order.
    fn candidates<'a>(
        &'a self,
        query: &RuleQuery,
    ) -> Result<Vec<(PatternId, &'a Rule)>, ResolveError> {
        // Only the Internet class is eligible; everything else passes through.
        if query.query_class != DNSClass::IN {
            trace!(name = %query.name, class = %query.query_class, "non-IN query, skipping");
            return Ok(Vec::new());
        }

        let mut survivors = Vec::new();
        for id in self.index.matches(&query.name) {
            let rule = self.table.get(id)?;
            if !rule.accepts_class(query.query_class) {
                trace!(name = %query.name, %id, "class mismatch");
                continue;
            }
            if !rule.accepts_type(query.query_type) {
                trace!(name = %query.name, %id, "type mismatch");
                continue;
            }
            if rule.excludes(&query.name) {
                trace!(name = %query.name, %id, "apex excluded from subdomain rule");
                continue;
            }
            survivors.push((id, rule));
        }
        Ok(survivors)
    }

    /// The single highest-priority rule for `query`, if any.
    ///
    /// Ties go to the rule that was configured first.
    pub fn resolve(&self, query: &RuleQuery) -> Result<Option<&Rule>, ResolveError> {
        let mut chosen: Option<(PatternId, &Rule)> = None;
        for (id, rule) in self.candidates(query)? {
            match chosen {
                Some((_, best)) if rule.priority <= best.priority => {}
                _ => chosen = Some((id, rule)),
            }
        }

        if let Some((id, rule)) = chosen {
            debug!(
                name = %query.name,
                %id,
                pattern = %rule.pattern,
                priority = %rule.priority,
                "rule selected"
            );
        }
        Ok(chosen.map(|(_, rule)| rule))
    }

    /// Rules to render for `query` under the configured policy.
    ///
    /// `HighestPriority` yields at most one rule. `Accumulate` yields the
    /// surviving rules by descending priority, then configuration order,
    /// up to and including the first rule without `fallthrough`.
    pub fn select(&self, query: &RuleQuery) -> Result<Vec<&Rule>, ResolveError> {
        match self.policy {
            ResolutionPolicy::HighestPriority => Ok(self.resolve(query)?.into_iter().collect()),
            ResolutionPolicy::Accumulate => {
                let mut candidates = self.candidates(query)?;
                candidates.sort_by(|(a_id, a), (b_id, b)| {
                    b.priority.cmp(&a.priority).then(a_id.cmp(b_id))
                });

                let mut selected = Vec::new();
                for (_, rule) in candidates {
                    selected.push(rule);
                    if !rule.fallthrough {
                        break;
                    }
                }
                debug!(name = %query.name, rules = selected.len(), "rules accumulated");
                Ok(selected)
            }
        }
    }
}
