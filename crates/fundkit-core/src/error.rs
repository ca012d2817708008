use std::fmt;

use thiserror::Error;

use crate::models::Kit;
use crate::store::StoreError;

pub type Result<T> = std::result::Result<T, KitError>;

/// Which write a failure belongs to, for reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    InsertKit,
    UpdateKit { id: String },
    DeleteKit { id: String },
    InsertSection { position: i32 },
    UpdateSection { id: String },
    DeleteSection { id: String },
    InsertItem { section_position: i32, position: i32 },
    UpdateItem { id: String },
    DeleteItem { id: String },
    InsertFundraiser,
    DeleteFundraiser { id: String },
    ClearFundraiser { kit_id: String },
    Read { table: &'static str },
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::InsertKit => write!(f, "insert kit"),
            Operation::UpdateKit { id } => write!(f, "update kit {}", id),
            Operation::DeleteKit { id } => write!(f, "delete kit {}", id),
            Operation::InsertSection { position } => write!(f, "insert section at {}", position),
            Operation::UpdateSection { id } => write!(f, "update section {}", id),
            Operation::DeleteSection { id } => write!(f, "delete section {}", id),
            Operation::InsertItem { section_position, position } => {
                write!(f, "insert item {} of section {}", position, section_position)
            }
            Operation::UpdateItem { id } => write!(f, "update item {}", id),
            Operation::DeleteItem { id } => write!(f, "delete item {}", id),
            Operation::InsertFundraiser => write!(f, "insert fundraiser"),
            Operation::DeleteFundraiser { id } => write!(f, "delete fundraiser {}", id),
            Operation::ClearFundraiser { kit_id } => write!(f, "clear fundraiser on kit {}", kit_id),
            Operation::Read { table } => write!(f, "read {}", table),
        }
    }
}

/// Why one operation did not happen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureCause {
    /// The store rejected the call.
    Store(String),
    /// Skipped because the operation it depends on failed.
    Dependency(Operation),
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureCause::Store(message) => f.write_str(message),
            FailureCause::Dependency(op) => write!(f, "skipped, {} failed", op),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationFailure {
    pub operation: Operation,
    pub cause: FailureCause,
}

impl fmt::Display for OperationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.operation, self.cause)
    }
}

/// Every failed operation from one save or delete.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Failures(pub Vec<OperationFailure>);

impl Failures {
    pub fn push(&mut self, operation: Operation, cause: FailureCause) {
        self.0.push(OperationFailure { operation, cause });
    }

    pub fn store(&mut self, operation: Operation, error: &StoreError) {
        self.push(operation, FailureCause::Store(error.to_string()));
    }

    pub fn extend(&mut self, other: Failures) {
        self.0.extend(other.0);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &OperationFailure> {
        self.0.iter()
    }
}

impl fmt::Display for Failures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, failure) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}", failure)?;
        }
        Ok(())
    }
}

#[derive(Error, Debug)]
pub enum KitError {
    #[error("Invalid kit: {0}")]
    Validation(String),

    #[error("Storage error during {operation}: {source}")]
    Storage {
        operation: Operation,
        #[source]
        source: StoreError,
    },

    #[error("Upload to {destination} failed: {message}")]
    Upload { destination: String, message: String },

    #[error("Not found: {0}")]
    NotFound(String),

    /// Some writes landed and some did not. `kit` is the state read back after
    /// the attempt when that read succeeded.
    #[error("{} operation(s) failed: {failures}", .failures.len())]
    Incomplete {
        kit_id: Option<String>,
        failures: Failures,
        kit: Option<Box<Kit>>,
    },
}

impl KitError {
    pub fn storage(operation: Operation, source: StoreError) -> Self {
        KitError::Storage { operation, source }
    }

    /// Whether a fresh read followed by another save could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, KitError::Storage { .. } | KitError::Incomplete { .. } | KitError::Upload { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failures_display_lists_each_operation() {
        let mut failures = Failures::default();
        failures.push(
            Operation::InsertSection { position: 1 },
            FailureCause::Store("Server error: boom".to_string()),
        );
        failures.push(
            Operation::InsertItem { section_position: 1, position: 0 },
            FailureCause::Dependency(Operation::InsertSection { position: 1 }),
        );

        let err = KitError::Incomplete {
            kit_id: Some("k1".to_string()),
            failures,
            kit: None,
        };
        assert_eq!(
            err.to_string(),
            "2 operation(s) failed: insert section at 1: Server error: boom; \
             insert item 0 of section 1: skipped, insert section at 1 failed"
        );
        assert!(err.is_retryable());
        assert!(!KitError::Validation("name".to_string()).is_retryable());
    }
}
