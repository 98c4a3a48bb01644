//! The failure taxonomy shared across the engine.
//!
//! Three kinds of trouble flow through the node graph and they must not be
//! conflated: a *logical* failure (a rule body returned an error) is a
//! memoizable result; an *infrastructure* failure (store I/O, sandbox setup)
//! reflects the host rather than the inputs and is never cached; an
//! *invalidation* interrupt means the inputs changed mid-run and the request
//! should be retried, not reported.

use thiserror::Error;

/// A failure produced while computing a node.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Failure {
    /// A rule body (or a child it depended on) failed logically.
    /// Cached for the generation like any other result.
    #[error("{0}")]
    Error(String),

    /// Infrastructure failed (store I/O, sandbox setup, spawn). Fatal for the
    /// affected request and never cached, since it does not reflect the
    /// logical inputs.
    #[error("fatal: {0}")]
    Fatal(String),

    /// The node's inputs were invalidated while it was running. Root requests
    /// retry; inner requests propagate upward.
    #[error("computation was invalidated")]
    Invalidated,
}

impl Failure {
    pub fn is_invalidated(&self) -> bool {
        matches!(self, Failure::Invalidated)
    }

    /// Whether this failure may be memoized as a node result.
    pub fn is_cacheable(&self) -> bool {
        matches!(self, Failure::Error(_))
    }

    /// Prefix a parent-side context onto a logical failure, preserving the
    /// kind for the other variants.
    pub fn with_context(self, context: &str) -> Failure {
        match self {
            Failure::Error(msg) => Failure::Error(format!("{}: {}", context, msg)),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_logical_failures_are_cacheable() {
        assert!(Failure::Error("boom".into()).is_cacheable());
        assert!(!Failure::Fatal("disk".into()).is_cacheable());
        assert!(!Failure::Invalidated.is_cacheable());
    }

    #[test]
    fn context_wraps_logical_only() {
        let wrapped = Failure::Error("boom".into()).with_context("while linking");
        assert_eq!(wrapped, Failure::Error("while linking: boom".into()));

        let fatal = Failure::Fatal("disk".into()).with_context("while linking");
        assert_eq!(fatal, Failure::Fatal("disk".into()));
    }
}
