//! Structured error types for the fishoil ledger core.
//!
//! Every public library function returns [`Result<T>`] which carries a
//! domain-specific [`FishoilError`]. Fraud outcomes (FLAG / REJECT / HALT)
//! are *not* errors; they travel as [`crate::fraud::Verdict`] values. Only a
//! HALT that reaches the ledger surfaces here, as [`FishoilError::LedgerHalted`].

use thiserror::Error;

use crate::fields::FieldId;
use crate::ledger::HaltReason;
use crate::receipt::{LotId, Stage};

// ---------------------------------------------------------------------------
// Validation errors
// ---------------------------------------------------------------------------

/// Field-level problems detected before any hashing or append happens.
///
/// These are local to one lot: they never affect the ledger's ability to
/// keep serving other lots.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("missing required fields {0:?}")]
    MissingFields(Vec<FieldId>),

    #[error("field {field} is not owned by stage {stage}")]
    UnexpectedField { field: FieldId, stage: Stage },

    #[error("field {field} is malformed: {reason}")]
    Malformed { field: FieldId, reason: String },

    #[error("missing required attributes {0:?}")]
    MissingAttributes(Vec<String>),

    #[error("attribute {name} is malformed: {reason}")]
    MalformedAttribute { name: String, reason: String },

    #[error("lot number {0} is already assigned to another lot")]
    DuplicateLotNumber(String),

    #[error("stage {0} cannot be built by the stage processor")]
    UnsupportedStage(Stage),

    #[error("invalid lot id '{0}': 1-64 chars, alphanumeric/hyphen/dot/underscore")]
    InvalidLotId(String),
}

// ---------------------------------------------------------------------------
// Primary error enum
// ---------------------------------------------------------------------------

/// Domain-specific error type for the fishoil ledger core.
#[derive(Error, Debug)]
pub enum FishoilError {
    #[error("validation: {0}")]
    Validation(#[from] ValidationError),

    /// Append-time integrity violation: the receipt does not chain onto the
    /// current tail.
    #[error("chain link mismatch: expected previous_hash {expected}, found {found}")]
    ChainLinkMismatch { expected: String, found: String },

    #[error("invalid receipt: {0}")]
    InvalidReceipt(String),

    #[error("ledger halted: {0}")]
    LedgerHalted(HaltReason),

    #[error("ledger locked: {0}")]
    LedgerLocked(String),

    #[error("lot {0} is blocked by an earlier REJECT verdict")]
    LotBlocked(LotId),

    #[error("lot {lot}: expected stage {expected}, got {found}")]
    StageOrder {
        lot: LotId,
        expected: String,
        found: Stage,
    },

    #[error("ledger: {0}")]
    Ledger(String),

    #[error("encoding: {0}")]
    Encoding(String),

    #[error("config: {0}")]
    Config(String),

    #[error("report: {0}")]
    Report(String),

    /// Catch-all for errors that do not fit a specific domain.
    #[error("{0}")]
    Other(String),
}

impl FishoilError {
    /// `true` for the conditions that must stop every further append.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::LedgerHalted(_))
    }
}

/// Convenience alias used throughout the library.
pub type Result<T> = std::result::Result<T, FishoilError>;

// ---------------------------------------------------------------------------
// Context extension trait
// ---------------------------------------------------------------------------

/// Extension trait that adds domain-specific context to any `Result<T, E>`.
///
/// Usage mirrors `anyhow::Context` but tags the error with the originating
/// subsystem so that callers can categorise failures.
///
/// ```ignore
/// std::fs::read(path).ctx_ledger("read ledger file")?;
/// ```
pub trait ResultExt<T> {
    fn ctx_ledger(self, msg: &str) -> Result<T>;
    fn ctx_encoding(self, msg: &str) -> Result<T>;
    fn ctx_config(self, msg: &str) -> Result<T>;
    fn ctx_report(self, msg: &str) -> Result<T>;
}

impl<T, E: std::fmt::Display> ResultExt<T> for std::result::Result<T, E> {
    fn ctx_ledger(self, msg: &str) -> Result<T> {
        self.map_err(|e| FishoilError::Ledger(format!("{msg}: {e}")))
    }
    fn ctx_encoding(self, msg: &str) -> Result<T> {
        self.map_err(|e| FishoilError::Encoding(format!("{msg}: {e}")))
    }
    fn ctx_config(self, msg: &str) -> Result<T> {
        self.map_err(|e| FishoilError::Config(format!("{msg}: {e}")))
    }
    fn ctx_report(self, msg: &str) -> Result<T> {
        self.map_err(|e| FishoilError::Report(format!("{msg}: {e}")))
    }
}

/// Same as [`ResultExt`] but for `Option<T>` (converts `None` into an error).
pub trait OptionExt<T> {
    fn required_report(self, msg: &str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn required_report(self, msg: &str) -> Result<T> {
        self.ok_or_else(|| FishoilError::Report(msg.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ctx_tags_subsystem() {
        let r: std::result::Result<(), &str> = Err("boom");
        let err = r.ctx_ledger("append").unwrap_err();
        assert_eq!(err.to_string(), "ledger: append: boom");
    }

    #[test]
    fn missing_fields_message_lists_ids() {
        let err = FishoilError::from(ValidationError::MissingFields(vec![
            FieldId::SPECIES,
            FieldId::IMPORT_DOCS,
        ]));
        assert_eq!(err.to_string(), "validation: missing required fields [1, 3]");
    }

    #[test]
    fn none_becomes_report_error() {
        let err = None::<u8>.required_report("no receipts for lot").unwrap_err();
        assert!(matches!(err, FishoilError::Report(_)));
    }
}
