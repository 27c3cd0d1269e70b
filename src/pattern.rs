//! Multi-pattern name index.
//!
//! Patterns come in four kinds and every registration gets its own stable
//! [`PatternId`]. Once built, [`PatternIndex::matches`] returns the ids of all
//! patterns that match a query name:
//!
//! - **Full**: exact name, O(1) hash lookup
//! - **Domain**: the name itself or any subdomain, one hash lookup per label
//! - **Substring**: Aho-Corasick over all keywords, overlapping matches
//! - **Regex**: a single `RegexSet` pass, unanchored and case-insensitive
//!
//! ```
//! use template_dns::pattern::{Pattern, PatternIndexBuilder};
//!
//! let mut builder = PatternIndexBuilder::new();
//! let exact = builder.register(Pattern::Full("example.com".into()));
//! let suffix = builder.register(Pattern::Domain("example.com".into()));
//! let index = builder.build().unwrap();
//!
//! assert_eq!(index.matches("EXAMPLE.com."), vec![exact, suffix]);
//! assert_eq!(index.matches("www.example.com"), vec![suffix]);
//! assert!(index.matches("notexample.com").is_empty());
//! ```

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use aho_corasick::AhoCorasick;
use regex::{RegexBuilder, RegexSet, RegexSetBuilder};
use tracing::debug;

use crate::error::ConfigError;

/// Stable identifier of a registered pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PatternId(u32);

impl fmt::Display for PatternId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A matching expression over domain names.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Pattern {
    /// Exact name match.
    Full(String),
    /// The name or any name below it, on label boundaries.
    Domain(String),
    /// Text occurring anywhere in the name.
    Substring(String),
    /// Regular expression searched in the full name.
    Regex(String),
}

impl Pattern {
    /// Short name of the pattern kind, used for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Pattern::Full(_) => "full",
            Pattern::Domain(_) => "domain",
            Pattern::Substring(_) => "keyword",
            Pattern::Regex(_) => "regexp",
        }
    }

    /// Pattern text without its kind.
    pub fn text(&self) -> &str {
        match self {
            Pattern::Full(s) | Pattern::Domain(s) | Pattern::Substring(s) | Pattern::Regex(s) => s,
        }
    }

    /// Text in the form the index matches on. Two patterns of the same kind
    /// with equal keys match exactly the same names.
    pub fn key(&self) -> String {
        match self {
            Pattern::Full(name) => normalize_name(name),
            Pattern::Domain(name) => normalize_name(name.trim_start_matches('.')),
            Pattern::Substring(text) => text.to_ascii_lowercase(),
            Pattern::Regex(source) => source.clone(),
        }
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pattern::Full(s) => f.write_str(s),
            _ => write!(f, "{}:{}", self.kind(), self.text()),
        }
    }
}

/// Lowercase a name and strip one trailing root dot.
pub fn normalize_name(name: &str) -> String {
    let name = name.strip_suffix('.').unwrap_or(name);
    name.to_ascii_lowercase()
}

/// Collects patterns before compiling them into a [`PatternIndex`].
#[derive(Debug, Default)]
pub struct PatternIndexBuilder {
    patterns: Vec<Pattern>,
}

impl PatternIndexBuilder {
    /// Create an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pattern and return its id. Ids are dense and assigned in
    /// registration order.
    pub fn register(&mut self, pattern: Pattern) -> PatternId {
        let id = PatternId(self.patterns.len() as u32);
        self.patterns.push(pattern);
        id
    }

    /// Compile all registered patterns.
    pub fn build(self) -> Result<PatternIndex, ConfigError> {
        let mut full: HashMap<String, Vec<PatternId>> = HashMap::new();
        let mut domain: HashMap<String, Vec<PatternId>> = HashMap::new();
        let mut keywords = Vec::new();
        let mut keyword_ids = Vec::new();
        let mut regexes = Vec::new();
        let mut regex_ids = Vec::new();

        for (i, pattern) in self.patterns.into_iter().enumerate() {
            let id = PatternId(i as u32);
            match pattern {
                Pattern::Full(_) => full.entry(pattern.key()).or_default().push(id),
                Pattern::Domain(_) => domain.entry(pattern.key()).or_default().push(id),
                Pattern::Substring(_) => {
                    keywords.push(pattern.key());
                    keyword_ids.push(id);
                }
                Pattern::Regex(source) => {
                    // Compile individually so the error names the culprit.
                    RegexBuilder::new(&source)
                        .case_insensitive(true)
                        .build()
                        .map_err(|source_err| ConfigError::InvalidRegex {
                            pattern: source.clone(),
                            source: source_err,
                        })?;
                    regexes.push(source);
                    regex_ids.push(id);
                }
            }
        }

        let keyword_automaton = if keywords.is_empty() {
            None
        } else {
            Some(AhoCorasick::new(&keywords)?)
        };

        let regex_set = if regexes.is_empty() {
            None
        } else {
            Some(
                RegexSetBuilder::new(&regexes)
                    .case_insensitive(true)
                    .build()
                    .map_err(|source| ConfigError::InvalidRegex {
                        pattern: regexes.join(" | "),
                        source,
                    })?,
            )
        };

        debug!(
            full = full.len(),
            domain = domain.len(),
            keyword = keyword_ids.len(),
            regexp = regex_ids.len(),
            "built pattern index"
        );

        Ok(PatternIndex {
            full,
            domain,
            keyword_automaton,
            keyword_ids,
            regex_set,
            regex_ids,
        })
    }
}

/// Immutable index answering "which patterns match this name".
///
/// Safe to share between query tasks; lookups never mutate.
#[derive(Debug)]
pub struct PatternIndex {
    full: HashMap<String, Vec<PatternId>>,
    domain: HashMap<String, Vec<PatternId>>,
    keyword_automaton: Option<AhoCorasick>,
    /// Pattern ids indexed by automaton pattern number
    keyword_ids: Vec<PatternId>,
    regex_set: Option<RegexSet>,
    /// Pattern ids indexed by regex set position
    regex_ids: Vec<PatternId>,
}

impl PatternIndex {
    /// Ids of all patterns matching `name`, in ascending order.
    ///
    /// The name is normalized first. Returns an empty vector when nothing
    /// matches.
    pub fn matches(&self, name: &str) -> Vec<PatternId> {
        let name = normalize_name(name);
        let mut found = BTreeSet::new();

        if let Some(ids) = self.full.get(&name) {
            found.extend(ids.iter().copied());
        }

        self.match_domain(&name, &mut found);

        if let Some(automaton) = &self.keyword_automaton {
            for mat in automaton.find_overlapping_iter(&name) {
                found.insert(self.keyword_ids[mat.pattern().as_usize()]);
            }
        }

        if let Some(set) = &self.regex_set {
            found.extend(set.matches(&name).into_iter().map(|i| self.regex_ids[i]));
        }

        found.into_iter().collect()
    }

    /// Walk `a.b.example.com`, `b.example.com`, `example.com`, `com`.
    fn match_domain(&self, name: &str, found: &mut BTreeSet<PatternId>) {
        if self.domain.is_empty() {
            return;
        }

        let mut suffix = name;
        loop {
            if let Some(ids) = self.domain.get(suffix) {
                found.extend(ids.iter().copied());
            }
            match suffix.find('.') {
                Some(dot) => suffix = &suffix[dot + 1..],
                None => break,
            }
        }
    }

    /// Total number of indexed patterns.
    pub fn len(&self) -> usize {
        self.full.values().map(Vec::len).sum::<usize>()
            + self.domain.values().map(Vec::len).sum::<usize>()
            + self.keyword_ids.len()
            + self.regex_ids.len()
    }

    /// True if the index holds no patterns.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
