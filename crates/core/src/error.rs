//! Domain error model.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Which rule a conflicting request ran into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// A GRN already exists for the purchase order + sequence (including a second first GRN).
    DuplicateGrn,
    /// The GRN's verification status has already been decided.
    AlreadyVerified,
    /// Inventory has already been written for the GRN.
    AlreadyMaterialized,
    /// The requested lifecycle move is not allowed from the current state.
    InvalidTransition,
    /// The row changed underneath the caller (optimistic concurrency).
    StaleVersion,
}

impl ConflictKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ConflictKind::DuplicateGrn => "duplicate_grn",
            ConflictKind::AlreadyVerified => "already_verified",
            ConflictKind::AlreadyMaterialized => "already_materialized",
            ConflictKind::InvalidTransition => "invalid_transition",
            ConflictKind::StaleVersion => "stale_version",
        }
    }
}

impl core::fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Domain-level error.
///
/// Keep this focused on deterministic, business/domain failures (validation,
/// invariants, conflicts). Persistence failures belong to the infrastructure layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A quantity was negative or otherwise unusable.
    #[error("invalid quantity for `{field}`: {reason}")]
    InvalidQuantity { field: String, reason: String },

    /// A value failed validation (e.g. missing material name).
    #[error("validation failed for `{field}`: {message}")]
    Validation { field: String, message: String },

    /// A domain invariant was violated.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A referenced entity does not exist.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// The request conflicts with the current authoritative state.
    #[error("conflict ({kind}): {message}")]
    Conflict { kind: ConflictKind, message: String },
}

impl DomainError {
    pub fn invalid_quantity(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidQuantity {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn conflict(kind: ConflictKind, message: impl Into<String>) -> Self {
        Self::Conflict {
            kind,
            message: message.into(),
        }
    }

    pub fn conflict_kind(&self) -> Option<ConflictKind> {
        match self {
            DomainError::Conflict { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Prefix the offending field with the collection path it came from
    /// (e.g. `received_quantity` → `items[2].received_quantity`).
    pub fn within(self, prefix: &str) -> Self {
        match self {
            DomainError::InvalidQuantity { field, reason } => DomainError::InvalidQuantity {
                field: format!("{prefix}.{field}"),
                reason,
            },
            DomainError::Validation { field, message } => DomainError::Validation {
                field: format!("{prefix}.{field}"),
                message,
            },
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn within_prefixes_field_errors_only() {
        let err = DomainError::invalid_quantity("received_quantity", "must not be negative")
            .within("items[1]");
        assert_eq!(
            err,
            DomainError::invalid_quantity("items[1].received_quantity", "must not be negative")
        );

        let err = DomainError::not_found("grn", "x").within("items[0]");
        assert_eq!(err, DomainError::not_found("grn", "x"));
    }

    #[test]
    fn conflict_display_names_kind() {
        let err = DomainError::conflict(ConflictKind::DuplicateGrn, "grn #1 exists");
        assert_eq!(err.to_string(), "conflict (duplicate_grn): grn #1 exists");
    }
}
