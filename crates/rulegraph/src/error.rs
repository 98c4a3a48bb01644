use forge_core::TypeId;
use thiserror::Error;

/// Whole-program compile failures. All of these are fatal at startup: no
/// partial graph is ever installed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    #[error(
        "Ambiguous rules to compute {product} with {available}: {}",
        .candidates.join(", ")
    )]
    Ambiguous {
        product: TypeId,
        /// Rendering of the available param set at the ambiguous selection.
        available: String,
        /// Names of every equally-minimal candidate.
        candidates: Vec<String>,
    },

    #[error(
        "No rule or registered root param can produce {product} with {available}{}",
        .details.concat()
    )]
    Unsatisfiable {
        product: TypeId,
        available: String,
        /// Per-candidate reasons (pre-rendered, one per line), when
        /// candidates existed but none were viable.
        details: Vec<String>,
    },

    #[error("Cycle in rule resolution:\n  {}", .path.join("\n  -> "))]
    Cycle { path: Vec<String> },

    #[error(
        "Rules were not reachable from any registered query: {}",
        .rules.join(", ")
    )]
    Unreachable { rules: Vec<String> },

    #[error("Query for {product} uses param {param}, which no RootRule registered")]
    UnregisteredRootParam { product: TypeId, param: TypeId },

    #[error(
        "No query matches a request for {product} with {available}{}",
        .suggestions.concat()
    )]
    NoQueryForRequest {
        product: TypeId,
        available: String,
        /// Registered queries for this product (pre-rendered, one per line).
        suggestions: Vec<String>,
    },

    #[error(
        "More than one query matches a request for {product} with {available}: {}",
        .matches.join(", ")
    )]
    AmbiguousRequest {
        product: TypeId,
        available: String,
        matches: Vec<String>,
    },
}
