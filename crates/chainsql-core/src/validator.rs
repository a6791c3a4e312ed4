//! `SqlValidator` — the statement validation collaborator.
//!
//! Parsing internals are out of scope for the core; the daemon only relies
//! on the classification this trait returns. Read-only classifications are
//! rejected by the ingestion path.

use crate::error::ValidationError;

/// The outcome of validating a statement embedded in a mutation event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidatedSql {
    /// The statement is a read query. The ingestion daemon skips these.
    ReadQuery(String),
    /// The statement expands to one or more mutating statements, ready to
    /// execute against a batch.
    Mutations(Vec<String>),
}

pub trait SqlValidator: Send + Sync {
    fn validate_run_sql(&self, statement: &str) -> Result<ValidatedSql, ValidationError>;
}
