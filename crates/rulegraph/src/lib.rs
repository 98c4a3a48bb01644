//! Static rule-graph compilation.
//!
//! Given the registered rules, RootRules and queries, compilation resolves
//! every dependency selector to exactly one producing rule and installs a
//! read-only entry table, or fails with a descriptive [`CompileError`]
//! naming the offending types and candidates. The scheduler then maps
//! requests onto compiled entries without ever searching again.

pub mod builder;
pub mod error;
pub mod rules;

use std::collections::BTreeSet;
use std::io;

use forge_core::TypeId;

pub use builder::compile;
pub use error::CompileError;
pub use rules::{DependencyKey, Query, Rule, RuleSet};

use rules::params_str;

/// Index of an [`Entry`] in the compiled table.
pub type EntryId = usize;

/// What computes an entry's value at runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntrySource {
    /// Satisfied directly from the in-scope Params bag.
    Param(TypeId),
    /// Computed by the rule at this index.
    Rule(usize),
    /// A sealed root entry for a registered query.
    Root(Query),
}

/// One compiled node of the rule graph: a selected way to produce a product
/// within a particular scope of param types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub source: EntrySource,
    /// Param types this entry draws (transitively) from its scope. Runtime
    /// node identity uses exactly this subset of the bag.
    pub params: BTreeSet<TypeId>,
    /// Resolved entry per declared param selector, in declaration order.
    pub param_deps: Vec<EntryId>,
    /// Resolved entry per declared Get, in declaration order. For Root
    /// entries this holds the single selected entry.
    pub get_deps: Vec<EntryId>,
}

/// The installed, read-only compiled graph.
#[derive(Debug)]
pub struct RuleGraph<B> {
    rules: Vec<Rule<B>>,
    entries: Vec<Entry>,
    queries: Vec<(Query, EntryId)>,
}

impl<B> RuleGraph<B> {
    pub(crate) fn new_compiled(
        rules: Vec<Rule<B>>,
        entries: Vec<Entry>,
        queries: Vec<(Query, EntryId)>,
    ) -> Self {
        RuleGraph {
            rules,
            entries,
            queries,
        }
    }

    pub fn entry(&self, id: EntryId) -> &Entry {
        &self.entries[id]
    }

    pub fn rule(&self, idx: usize) -> &Rule<B> {
        &self.rules[idx]
    }

    /// The rule backing an entry, if it is a rule entry.
    pub fn rule_for_entry(&self, id: EntryId) -> Option<&Rule<B>> {
        match self.entries[id].source {
            EntrySource::Rule(idx) => Some(&self.rules[idx]),
            _ => None,
        }
    }

    /// The full entry table; identical across compilations of the same set.
    pub fn entry_table(&self) -> &[Entry] {
        &self.entries
    }

    pub fn queries(&self) -> impl Iterator<Item = &Query> {
        self.queries.iter().map(|(q, _)| q)
    }

    /// Resolve a request to its root entry.
    ///
    /// Prefers an exact (product, params) query match; otherwise a unique
    /// query whose params are a subset of what the caller supplied. Zero or
    /// multiple subset matches are descriptive errors.
    pub fn find_root(
        &self,
        product: TypeId,
        available: &BTreeSet<TypeId>,
    ) -> Result<EntryId, CompileError> {
        if let Some((_, id)) = self
            .queries
            .iter()
            .find(|(q, _)| q.product == product && q.params == *available)
        {
            return Ok(*id);
        }

        let subset_matches: Vec<&(Query, EntryId)> = self
            .queries
            .iter()
            .filter(|(q, _)| q.product == product && q.params.is_subset(available))
            .collect();

        match subset_matches.len() {
            1 => Ok(subset_matches[0].1),
            0 => {
                let mut suggestions: Vec<String> = self
                    .queries
                    .iter()
                    .filter(|(q, _)| q.product == product)
                    .map(|(q, _)| format!("\n  {}", params_str(&q.params)))
                    .collect();
                suggestions.sort();
                Err(CompileError::NoQueryForRequest {
                    product,
                    available: params_str(available),
                    suggestions,
                })
            }
            _ => {
                let mut matches: Vec<String> = subset_matches
                    .iter()
                    .map(|(q, _)| q.to_string())
                    .collect();
                matches.sort();
                Err(CompileError::AmbiguousRequest {
                    product,
                    available: params_str(available),
                    matches,
                })
            }
        }
    }

    /// Human-readable label for an entry, used by visualization and logs.
    pub fn entry_label(&self, id: EntryId) -> String {
        match &self.entries[id].source {
            EntrySource::Param(t) => format!("Param({t})"),
            EntrySource::Rule(idx) => {
                format!("{} for {}", self.rules[*idx], params_str(&self.entries[id].params))
            }
            EntrySource::Root(query) => query.to_string(),
        }
    }

    /// Dump the compiled graph in graphviz dot format.
    pub fn visualize(&self, f: &mut dyn io::Write) -> io::Result<()> {
        writeln!(f, "digraph rules {{")?;
        let mut query_strs: Vec<String> = self.queries().map(|q| q.to_string()).collect();
        query_strs.sort();
        writeln!(f, "  // queries: {}", query_strs.join(", "))?;
        let mut lines = Vec::new();
        for (id, entry) in self.entries.iter().enumerate() {
            let label = self.entry_label(id);
            let deps: Vec<EntryId> = entry
                .param_deps
                .iter()
                .chain(entry.get_deps.iter())
                .copied()
                .collect();
            if deps.is_empty() {
                lines.push(format!("  \"{label}\""));
            } else {
                let mut dep_labels: Vec<String> = deps
                    .into_iter()
                    .map(|d| format!("\"{}\"", self.entry_label(d)))
                    .collect();
                dep_labels.sort();
                dep_labels.dedup();
                lines.push(format!("  \"{label}\" -> {{{}}}", dep_labels.join(" ")));
            }
        }
        lines.sort();
        for line in lines {
            writeln!(f, "{line}")?;
        }
        writeln!(f, "}}")
    }
}
