//! The whole-program rule resolution pass.
//!
//! For every dependency selector of every reachable rule, pick the single
//! producer requiring the fewest param types drawn from the scope at that
//! point. A param type already in scope short-circuits at cost zero; ties
//! are ambiguity errors; a resolution path that re-enters the same product
//! with an equal-or-larger scope is a cycle error. Compilation is atomic —
//! any failure and nothing is installed.

use std::collections::{BTreeSet, HashMap, HashSet};

use forge_core::TypeId;
use indexmap::IndexMap;
use tracing::debug;

use crate::error::CompileError;
use crate::rules::{params_str, Query, Rule, RuleSet};
use crate::{Entry, EntryId, EntrySource, RuleGraph};

/// One viable instantiation of a candidate rule in a given scope.
struct Candidate {
    /// Param types drawn (transitively) from the scope: the selection cost.
    used: BTreeSet<TypeId>,
    param_deps: Vec<EntryId>,
    get_deps: Vec<EntryId>,
}

pub(crate) struct Builder<'r, B> {
    rules: &'r [Rule<B>],
    root_params: &'r BTreeSet<TypeId>,
    /// Rule indices by product type, in registration order.
    producers: IndexMap<TypeId, Vec<usize>>,
    entries: Vec<Entry>,
    param_entries: HashMap<TypeId, EntryId>,
    /// Identical rule instantiations intern to one entry.
    rule_entries: HashMap<(usize, Vec<EntryId>, Vec<EntryId>), EntryId>,
    memo: HashMap<(TypeId, BTreeSet<TypeId>), Result<EntryId, CompileError>>,
    /// In-progress resolution frames, for cycle detection.
    stack: Vec<(TypeId, BTreeSet<TypeId>)>,
    used_rules: HashSet<usize>,
}

impl<'r, B> Builder<'r, B> {
    fn new(rules: &'r [Rule<B>], root_params: &'r BTreeSet<TypeId>) -> Self {
        let mut producers: IndexMap<TypeId, Vec<usize>> = IndexMap::new();
        for (idx, rule) in rules.iter().enumerate() {
            producers.entry(rule.product).or_default().push(idx);
        }
        Builder {
            rules,
            root_params,
            producers,
            entries: Vec::new(),
            param_entries: HashMap::new(),
            rule_entries: HashMap::new(),
            memo: HashMap::new(),
            stack: Vec::new(),
            used_rules: HashSet::new(),
        }
    }

    fn param_entry(&mut self, param: TypeId) -> EntryId {
        if let Some(&id) = self.param_entries.get(&param) {
            return id;
        }
        let id = self.entries.len();
        self.entries.push(Entry {
            source: EntrySource::Param(param),
            params: [param].into_iter().collect(),
            param_deps: Vec::new(),
            get_deps: Vec::new(),
        });
        self.param_entries.insert(param, id);
        id
    }

    /// Select the producer for `product` given the in-scope param types.
    fn resolve(
        &mut self,
        product: TypeId,
        available: BTreeSet<TypeId>,
    ) -> Result<EntryId, CompileError> {
        // A param already in scope wins outright: cost zero.
        if available.contains(&product) {
            return Ok(self.param_entry(product));
        }

        let key = (product, available);
        if let Some(result) = self.memo.get(&key) {
            return result.clone();
        }

        // Re-entering the same product with an equal-or-larger scope can
        // never terminate: report the path rather than silently breaking it.
        if let Some(pos) = self
            .stack
            .iter()
            .position(|(p, a)| *p == product && a.is_subset(&key.1))
        {
            let mut path: Vec<String> = self.stack[pos..]
                .iter()
                .map(|(p, a)| format!("{} with {}", p, params_str(a)))
                .collect();
            path.push(format!("{} with {}", product, params_str(&key.1)));
            return Err(CompileError::Cycle { path });
        }

        self.stack.push(key.clone());
        let result = self.resolve_uncached(product, &key.1);
        self.stack.pop();
        self.memo.insert(key, result.clone());
        result
    }

    fn resolve_uncached(
        &mut self,
        product: TypeId,
        available: &BTreeSet<TypeId>,
    ) -> Result<EntryId, CompileError> {
        let candidate_indices = self.producers.get(&product).cloned().unwrap_or_default();
        if candidate_indices.is_empty() {
            return Err(CompileError::Unsatisfiable {
                product,
                available: params_str(available),
                details: Vec::new(),
            });
        }

        let mut viable: Vec<(usize, Candidate)> = Vec::new();
        let mut failures: Vec<String> = Vec::new();
        for idx in candidate_indices {
            match self.instantiate(idx, available) {
                Ok(candidate) => viable.push((idx, candidate)),
                // A cycle is a hard failure for the whole compilation, not a
                // disqualified candidate.
                Err(err @ CompileError::Cycle { .. }) => return Err(err),
                Err(err) => {
                    failures.push(format!("\n  {}: {}", self.rules[idx].name, err));
                }
            }
        }

        let min_cost = match viable.iter().map(|(_, c)| c.used.len()).min() {
            Some(min) => min,
            None => {
                return Err(CompileError::Unsatisfiable {
                    product,
                    available: params_str(available),
                    details: failures,
                });
            }
        };
        let mut minimal: Vec<(usize, Candidate)> = viable
            .into_iter()
            .filter(|(_, c)| c.used.len() == min_cost)
            .collect();

        if minimal.len() > 1 {
            let mut names: Vec<String> = minimal
                .iter()
                .map(|(idx, _)| self.rules[*idx].name.clone())
                .collect();
            names.sort();
            return Err(CompileError::Ambiguous {
                product,
                available: params_str(available),
                candidates: names,
            });
        }

        let (idx, candidate) = minimal.remove(0);
        self.used_rules.insert(idx);
        debug!(
            rule = %self.rules[idx],
            cost = candidate.used.len(),
            "selected rule for {product}"
        );
        Ok(self.intern_rule_entry(idx, candidate))
    }

    /// Attempt to satisfy every selector of the rule at `idx` in this scope.
    fn instantiate(
        &mut self,
        idx: usize,
        available: &BTreeSet<TypeId>,
    ) -> Result<Candidate, CompileError> {
        let rule = &self.rules[idx];
        let params = rule.params.clone();
        let gets = rule.gets.clone();

        let mut used = BTreeSet::new();
        let mut param_deps = Vec::with_capacity(params.len());
        for param in params {
            if available.contains(&param) {
                used.insert(param);
                param_deps.push(self.param_entry(param));
            } else {
                let dep = self.resolve(param, available.clone())?;
                used.extend(self.entries[dep].params.iter().copied());
                param_deps.push(dep);
            }
        }

        let mut get_deps = Vec::with_capacity(gets.len());
        for get in gets {
            let mut child_available = available.clone();
            child_available.extend(get.provides.iter().copied());
            let dep = self.resolve(get.product, child_available)?;
            // Types introduced at the Get site are not drawn from our scope.
            used.extend(
                self.entries[dep]
                    .params
                    .iter()
                    .filter(|t| !get.provides.contains(t))
                    .copied(),
            );
            get_deps.push(dep);
        }

        Ok(Candidate {
            used,
            param_deps,
            get_deps,
        })
    }

    fn intern_rule_entry(&mut self, idx: usize, candidate: Candidate) -> EntryId {
        let key = (
            idx,
            candidate.param_deps.clone(),
            candidate.get_deps.clone(),
        );
        if let Some(&id) = self.rule_entries.get(&key) {
            return id;
        }
        let id = self.entries.len();
        self.entries.push(Entry {
            source: EntrySource::Rule(idx),
            params: candidate.used,
            param_deps: candidate.param_deps,
            get_deps: candidate.get_deps,
        });
        self.rule_entries.insert(key, id);
        id
    }

    fn build(mut self, queries: &[Query]) -> Result<(Vec<Entry>, Vec<(Query, EntryId)>), CompileError> {
        let mut roots = Vec::with_capacity(queries.len());
        for query in queries {
            for param in &query.params {
                if !self.root_params.contains(param) {
                    return Err(CompileError::UnregisteredRootParam {
                        product: query.product,
                        param: *param,
                    });
                }
            }
            let selected = self.resolve(query.product, query.params.clone())?;
            let id = self.entries.len();
            self.entries.push(Entry {
                source: EntrySource::Root(query.clone()),
                params: self.entries[selected].params.clone(),
                param_deps: Vec::new(),
                get_deps: vec![selected],
            });
            roots.push((query.clone(), id));
        }

        // Every registered rule must have been selected somewhere: a rule
        // nothing can reach is dead weight or a shadowing accident.
        let unreachable: Vec<String> = self
            .rules
            .iter()
            .enumerate()
            .filter(|(idx, _)| !self.used_rules.contains(idx))
            .map(|(_, rule)| rule.name.clone())
            .collect();
        if !unreachable.is_empty() {
            return Err(CompileError::Unreachable { rules: unreachable });
        }

        Ok((self.entries, roots))
    }
}

/// Compile a rule set into an installed [`RuleGraph`], or fail atomically.
pub fn compile<B>(set: RuleSet<B>) -> Result<RuleGraph<B>, CompileError> {
    let RuleSet {
        rules,
        root_params,
        queries,
    } = set;
    let (entries, roots) = Builder::new(&rules, &root_params).build(&queries)?;
    debug!(
        rules = rules.len(),
        entries = entries.len(),
        queries = roots.len(),
        "rule graph compiled"
    );
    Ok(RuleGraph::new_compiled(rules, entries, roots))
}
