//! Rule declarations: what the authoring layer registers.

use std::collections::BTreeSet;
use std::fmt;

use forge_core::TypeId;

/// A dynamically-issued sub-request edge, discovered by the authoring layer
/// when it interprets a rule body: the requested Product plus the Param
/// types the call site introduces for the subtree.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DependencyKey {
    pub product: TypeId,
    pub provides: Vec<TypeId>,
}

impl DependencyKey {
    pub fn new(product: TypeId) -> Self {
        DependencyKey {
            product,
            provides: Vec::new(),
        }
    }

    pub fn provided(product: TypeId, provides: Vec<TypeId>) -> Self {
        DependencyKey { product, provides }
    }
}

impl fmt::Display for DependencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.provides.is_empty() {
            write!(f, "Get({})", self.product)
        } else {
            let provided: Vec<&str> = self.provides.iter().map(|t| t.name()).collect();
            write!(f, "Get({}, +[{}])", self.product, provided.join(", "))
        }
    }
}

/// A static rule declaration.
///
/// Identity is `(product, ordered param selectors)`; the body payload `B` is
/// opaque to compilation (the engine stores its callable there). Immutable
/// once registered.
#[derive(Debug, Clone)]
pub struct Rule<B> {
    pub name: String,
    pub product: TypeId,
    /// Declared input selectors, in declaration order.
    pub params: Vec<TypeId>,
    /// Declared Get edges, in declaration order.
    pub gets: Vec<DependencyKey>,
    pub body: B,
}

impl<B> Rule<B> {
    pub fn new(name: impl Into<String>, product: TypeId, params: Vec<TypeId>, body: B) -> Self {
        Rule {
            name: name.into(),
            product,
            params,
            gets: Vec::new(),
            body,
        }
    }

    pub fn with_gets(mut self, gets: Vec<DependencyKey>) -> Self {
        self.gets = gets;
        self
    }
}

impl<B> fmt::Display for Rule<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let params: Vec<&str> = self.params.iter().map(|t| t.name()).collect();
        write!(f, "{}({}) -> {}", self.name, params.join(", "), self.product)
    }
}

/// A sealed entry point: a Product callers may request, given a set of
/// caller-supplied Param types (each registered via a RootRule).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Query {
    pub product: TypeId,
    pub params: BTreeSet<TypeId>,
}

impl Query {
    pub fn new(product: TypeId, params: impl IntoIterator<Item = TypeId>) -> Self {
        Query {
            product,
            params: params.into_iter().collect(),
        }
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let params: Vec<&str> = self.params.iter().map(|t| t.name()).collect();
        write!(f, "Query({} for [{}])", self.product, params.join(", "))
    }
}

/// Render a param type set for error messages, deterministically.
pub(crate) fn params_str(params: &BTreeSet<TypeId>) -> String {
    let names: Vec<&str> = params.iter().map(|t| t.name()).collect();
    format!("Params({})", names.join(", "))
}

/// The full set of registered rules, root params and queries: the compiler's
/// input. Registration order is preserved so compilation is deterministic.
pub struct RuleSet<B> {
    pub(crate) rules: Vec<Rule<B>>,
    pub(crate) root_params: BTreeSet<TypeId>,
    pub(crate) queries: Vec<Query>,
}

impl<B> Default for RuleSet<B> {
    fn default() -> Self {
        RuleSet {
            rules: Vec::new(),
            root_params: BTreeSet::new(),
            queries: Vec::new(),
        }
    }
}

impl<B> RuleSet<B> {
    pub fn new() -> Self {
        RuleSet::default()
    }

    /// Register a rule.
    pub fn register(&mut self, rule: Rule<B>) -> &mut Self {
        self.rules.push(rule);
        self
    }

    /// Register a RootRule: a Param type the caller of a query may supply.
    pub fn register_root_param(&mut self, param: TypeId) -> &mut Self {
        self.root_params.insert(param);
        self
    }

    /// Register a query: a root Product, requestable with the given params.
    pub fn register_query(&mut self, query: Query) -> &mut Self {
        self.queries.push(query);
        self
    }

    pub fn rules(&self) -> &[Rule<B>] {
        &self.rules
    }
}
