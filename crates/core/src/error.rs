//! Domain error model.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Coarse error classification shared by every crate in the workspace.
///
/// Module-specific errors (`MoneyError`, `InventoryError`, `OrderError`, ...) each map onto
/// exactly one kind so callers (transport layers, retry policies) can branch without knowing
/// the concrete error type.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed input: empty required field, non-positive quantity, negative price.
    Validation,
    /// Operation not allowed in the current state (illegal transition, frozen order,
    /// over-committing stock).
    State,
    /// Unknown item / address / option id.
    NotFound,
    /// Arithmetic across different currencies.
    CurrencyMismatch,
    /// Optimistic concurrency conflict (stale version).
    Conflict,
    /// Storage or collaborator failure.
    Infrastructure,
}

/// Domain-level error.
///
/// Keep this focused on deterministic, business/domain failures (validation,
/// invariants, conflicts). Infrastructure concerns belong elsewhere.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. malformed input).
    #[error("validation failed: {0}")]
    Validation(String),

    /// A domain invariant or state rule was violated.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A requested resource was not found (domain-level).
    #[error("not found: {0}")]
    NotFound(String),

    /// Money arithmetic across different currencies.
    #[error("currency mismatch: {0}")]
    CurrencyMismatch(String),

    /// A conflict occurred (e.g. stale version / optimistic concurrency).
    #[error("conflict: {0}")]
    Conflict(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            DomainError::Validation(_) | DomainError::InvalidId(_) => ErrorKind::Validation,
            DomainError::InvariantViolation(_) => ErrorKind::State,
            DomainError::NotFound(_) => ErrorKind::NotFound,
            DomainError::CurrencyMismatch(_) => ErrorKind::CurrencyMismatch,
            DomainError::Conflict(_) => ErrorKind::Conflict,
        }
    }
}
