//! Error types for the loan ledger

use crate::types::{AccountId, Amount, LoanId, Timestamp};
use std::fmt;
use thiserror::Error;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Which deadline check rejected a call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryStage {
    /// Funding attempted at or after the due date
    Funding,
    /// Repayment attempted after the due date
    Repayment,
}

impl fmt::Display for ExpiryStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpiryStage::Funding => write!(f, "loan request can no longer be funded"),
            ExpiryStage::Repayment => write!(f, "repayment deadline has passed"),
        }
    }
}

/// Ledger errors
///
/// Every protocol rejection is raised before any state or balance is
/// touched, so a failed call leaves the ledger exactly as it was.
#[derive(Error, Debug)]
pub enum Error {
    /// Zero-value deposit on request
    #[error("Invalid amount: deposit must be greater than zero")]
    InvalidAmount,

    /// Identical untouched request already outstanding
    #[error("Duplicate request: loan {existing} has the same borrower, amount and interest rate")]
    DuplicateRequest {
        /// Id of the existing request
        existing: LoanId,
    },

    /// Loan id out of range
    #[error("Loan not found: {0}")]
    NotFound(LoanId),

    /// Loan already has a lender
    #[error("Loan {loan_id} already funded by {lender}")]
    AlreadyFunded {
        /// Loan id
        loan_id: LoanId,
        /// Current lender
        lender: AccountId,
    },

    /// Supplied value does not match the required amount
    #[error("Wrong amount for loan {loan_id}: expected {expected}, supplied {supplied}")]
    WrongAmount {
        /// Loan id
        loan_id: LoanId,
        /// Exact amount the operation requires
        expected: Amount,
        /// Amount the caller attached
        supplied: Amount,
    },

    /// Deadline check failed
    #[error("Loan {loan_id} expired: {stage}")]
    Expired {
        /// Loan id
        loan_id: LoanId,
        /// Which operation hit the deadline
        stage: ExpiryStage,
    },

    /// Caller is not the borrower
    #[error("Only the borrower may repay loan {loan_id}, caller was {caller}")]
    NotBorrower {
        /// Loan id
        loan_id: LoanId,
        /// Rejected caller
        caller: AccountId,
    },

    /// Loan has not been funded
    #[error("Loan {0} is not funded")]
    NotFunded(LoanId),

    /// Loan already repaid
    #[error("Loan {0} already repaid")]
    AlreadyRepaid(LoanId),

    /// Caller is not the lender
    #[error("Only the lender may claim collateral of loan {loan_id}, caller was {caller}")]
    NotLender {
        /// Loan id
        loan_id: LoanId,
        /// Rejected caller
        caller: AccountId,
    },

    /// Claim attempted at or before the due date
    #[error("Loan {loan_id} is not yet due (due date {due_date})")]
    NotYetDue {
        /// Loan id
        loan_id: LoanId,
        /// Due date of the loan
        due_date: Timestamp,
    },

    /// Collateral already seized
    #[error("Collateral of loan {0} already claimed")]
    AlreadyClaimed(LoanId),

    /// Caller cannot cover the value attached to a call
    #[error("Insufficient balance for {account}: required {required}, available {available}")]
    InsufficientBalance {
        /// Paying account
        account: AccountId,
        /// Value the call attaches
        required: Amount,
        /// Current balance
        available: Amount,
    },

    /// Arithmetic overflow (due date, repayment or balance)
    #[error("Arithmetic overflow: {0}")]
    Overflow(String),

    /// Invariant violation (custody, dense ids, etc.)
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Storage error (RocksDB)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Concurrency error (actor mailbox closed, etc.)
    #[error("Concurrency error: {0}")]
    Concurrency(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Stable label used for metrics and logs
    pub fn kind(&self) -> &'static str {
        match self {
            Error::InvalidAmount => "invalid_amount",
            Error::DuplicateRequest { .. } => "duplicate_request",
            Error::NotFound(_) => "not_found",
            Error::AlreadyFunded { .. } => "already_funded",
            Error::WrongAmount { .. } => "wrong_amount",
            Error::Expired { .. } => "expired",
            Error::NotBorrower { .. } => "not_borrower",
            Error::NotFunded(_) => "not_funded",
            Error::AlreadyRepaid(_) => "already_repaid",
            Error::NotLender { .. } => "not_lender",
            Error::NotYetDue { .. } => "not_yet_due",
            Error::AlreadyClaimed(_) => "already_claimed",
            Error::InsufficientBalance { .. } => "insufficient_balance",
            Error::Overflow(_) => "overflow",
            Error::InvariantViolation(_) => "invariant_violation",
            Error::Storage(_) => "storage",
            Error::Serialization(_) => "serialization",
            Error::Concurrency(_) => "concurrency",
            Error::Config(_) => "config",
            Error::Io(_) => "io",
            Error::Other(_) => "other",
        }
    }

    /// True when the call was refused by a guard rather than by the host
    pub fn is_rejection(&self) -> bool {
        !matches!(
            self,
            Error::InvariantViolation(_)
                | Error::Storage(_)
                | Error::Serialization(_)
                | Error::Concurrency(_)
                | Error::Config(_)
                | Error::Io(_)
                | Error::Other(_)
        )
    }
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

impl From<String> for Error {
    fn from(msg: String) -> Self {
        Error::Other(msg)
    }
}

impl From<&str> for Error {
    fn from(msg: &str) -> Self {
        Error::Other(msg.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_already_funded_names_lender() {
        let err = Error::AlreadyFunded {
            loan_id: 7,
            lender: AccountId::new("lender-1"),
        };
        assert!(err.to_string().contains("lender-1"));
        assert_eq!(err.kind(), "already_funded");
    }

    #[test]
    fn test_expiry_messages_differ() {
        let funding = Error::Expired {
            loan_id: 0,
            stage: ExpiryStage::Funding,
        };
        let repayment = Error::Expired {
            loan_id: 0,
            stage: ExpiryStage::Repayment,
        };
        assert_eq!(funding.kind(), repayment.kind());
        assert_ne!(funding.to_string(), repayment.to_string());
    }

    #[test]
    fn test_rejection_classification() {
        assert!(Error::InvalidAmount.is_rejection());
        assert!(Error::NotYetDue { loan_id: 1, due_date: 10 }.is_rejection());
        assert!(!Error::Storage("disk full".to_string()).is_rejection());
        assert!(!Error::Concurrency("closed".to_string()).is_rejection());
    }
}
