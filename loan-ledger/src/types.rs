//! Core types for the loan ledger
//!
//! All types are designed for:
//! - Deterministic serialization (bincode)
//! - Memory safety (no unsafe code)
//! - Exact arithmetic (integer native value units, floor division)

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Loan identifier (dense, 0-based, never reused)
pub type LoanId = u64;

/// Native value of the host ledger, in its smallest unit
pub type Amount = u128;

/// Seconds since Unix epoch
pub type Timestamp = u64;

/// Flat interest in whole percent, charged once at repayment
pub type InterestRate = u64;

/// Account identifier on the host ledger
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AccountId(String);

impl AccountId {
    /// Create new account ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for AccountId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Amount owed at repayment: principal plus `floor(principal * rate / 100)`
pub fn repayment_due(loan_amount: Amount, interest_rate: InterestRate) -> Result<Amount> {
    let interest = loan_amount
        .checked_mul(Amount::from(interest_rate))
        .ok_or_else(|| {
            Error::Overflow(format!(
                "interest on {} at {}% exceeds the value range",
                loan_amount, interest_rate
            ))
        })?
        / 100;

    loan_amount
        .checked_add(interest)
        .ok_or_else(|| Error::Overflow(format!("repayment of {} plus {}", loan_amount, interest)))
}

/// Loan record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Loan {
    /// Position of creation
    pub id: LoanId,

    /// Account that requested the loan and locked the collateral
    pub borrower: AccountId,

    /// Account that funded the loan (`None` until funded)
    pub lender: Option<AccountId>,

    /// Value deposited at request time
    pub collateral_amount: Amount,

    /// Principal paid to the borrower on funding (always equals collateral)
    pub loan_amount: Amount,

    /// Flat interest percentage
    pub interest_rate: InterestRate,

    /// Creation time plus requested duration
    pub due_date: Timestamp,

    /// Set once on funding
    pub is_funded: bool,

    /// Set once on repayment
    pub is_repaid: bool,

    /// Set once on collateral claim
    pub is_defaulted: bool,
}

impl Loan {
    /// Derived lifecycle status
    pub fn status(&self) -> LoanStatus {
        if self.is_defaulted {
            LoanStatus::Defaulted
        } else if self.is_repaid {
            LoanStatus::Repaid
        } else if self.is_funded {
            LoanStatus::Funded
        } else {
            LoanStatus::Requested
        }
    }

    /// Exact value `repay_loan` must carry
    pub fn repayment_due(&self) -> Result<Amount> {
        repayment_due(self.loan_amount, self.interest_rate)
    }

    /// Whether a lender can still fund this request at `now`
    pub fn is_fundable(&self, now: Timestamp) -> bool {
        !self.is_funded && now < self.due_date
    }

    /// Whether no operation can ever change this record again.
    ///
    /// A request that passed its due date unfunded is terminal too: its
    /// collateral stays in escrow with no return path.
    pub fn is_terminal(&self, now: Timestamp) -> bool {
        self.status().is_settled() || (!self.is_funded && !self.is_fundable(now))
    }

    /// Whether the collateral is still held in escrow
    pub fn holds_collateral(&self) -> bool {
        !self.status().is_settled()
    }

    /// Never funded, repaid or defaulted
    pub fn is_untouched(&self) -> bool {
        !self.is_funded && !self.is_repaid && !self.is_defaulted
    }
}

/// Loan status (derived from flags)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum LoanStatus {
    /// Collateral locked, waiting for a lender
    Requested = 1,
    /// Principal paid out, waiting for repayment
    Funded = 2,
    /// Repaid (terminal)
    Repaid = 3,
    /// Collateral seized (terminal)
    Defaulted = 4,
}

impl LoanStatus {
    /// Repaid or defaulted
    pub fn is_settled(&self) -> bool {
        matches!(self, LoanStatus::Repaid | LoanStatus::Defaulted)
    }
}

impl fmt::Display for LoanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoanStatus::Requested => write!(f, "requested"),
            LoanStatus::Funded => write!(f, "funded"),
            LoanStatus::Repaid => write!(f, "repaid"),
            LoanStatus::Defaulted => write!(f, "defaulted"),
        }
    }
}

/// Mutating operation kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    /// Request a loan against a deposit
    Request,
    /// Fund an open request
    Fund,
    /// Repay a funded loan
    Repay,
    /// Seize collateral of a defaulted loan
    Claim,
}

impl Operation {
    /// Label for logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Request => "request",
            Operation::Fund => "fund",
            Operation::Repay => "repay",
            Operation::Claim => "claim",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Notification emitted by a committed transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoanEvent {
    /// New request recorded
    LoanRequested {
        /// Borrower
        borrower: AccountId,
        /// Deposited collateral
        collateral_amount: Amount,
        /// Principal
        loan_amount: Amount,
        /// Flat interest percentage
        interest_rate: InterestRate,
        /// Due date
        due_date: Timestamp,
    },

    /// Request funded
    LoanFunded {
        /// Loan id
        id: LoanId,
    },

    /// Loan repaid
    LoanRepaid {
        /// Loan id
        id: LoanId,
    },

    /// Collateral seized by the lender
    CollateralClaimed {
        /// Borrower
        borrower: AccountId,
        /// Lender
        lender: AccountId,
        /// Seized collateral
        collateral_amount: Amount,
    },
}

impl LoanEvent {
    /// Event name
    pub fn name(&self) -> &'static str {
        match self {
            LoanEvent::LoanRequested { .. } => "LoanRequested",
            LoanEvent::LoanFunded { .. } => "LoanFunded",
            LoanEvent::LoanRepaid { .. } => "LoanRepaid",
            LoanEvent::CollateralClaimed { .. } => "CollateralClaimed",
        }
    }
}

/// Event with its position in the ledger's log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Unique event ID (UUIDv7 for time-ordering)
    pub event_id: Uuid,

    /// Position in the global event log
    pub sequence: u64,

    /// Loan the event belongs to
    pub loan_id: LoanId,

    /// Ledger time of the emitting operation
    pub timestamp: Timestamp,

    /// Payload
    pub event: LoanEvent,
}

/// Holder of native value
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Holder {
    /// External account
    Account(AccountId),
    /// The ledger's own custody balance
    Escrow,
}

impl fmt::Display for Holder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Holder::Account(account) => write!(f, "{}", account),
            Holder::Escrow => write!(f, "escrow"),
        }
    }
}

/// Movement of native value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    /// Source
    pub from: Holder,
    /// Destination
    pub to: Holder,
    /// Value moved
    pub amount: Amount,
}

impl Transfer {
    /// Value attached to a call, moving from the caller into escrow
    pub fn intake(from: &AccountId, amount: Amount) -> Self {
        Self {
            from: Holder::Account(from.clone()),
            to: Holder::Escrow,
            amount,
        }
    }

    /// Value paid out of escrow
    pub fn payout(to: &AccountId, amount: Amount) -> Self {
        Self {
            from: Holder::Escrow,
            to: Holder::Account(to.clone()),
            amount,
        }
    }
}

/// Outcome of a committed operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    /// Operation performed
    pub operation: Operation,

    /// Record after the transition
    pub loan: Loan,

    /// Events emitted, in order
    pub events: Vec<EventRecord>,

    /// Value moved, in order
    pub transfers: Vec<Transfer>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loan() -> Loan {
        Loan {
            id: 0,
            borrower: AccountId::new("borrower"),
            lender: None,
            collateral_amount: 3,
            loan_amount: 3,
            interest_rate: 1,
            due_date: 100,
            is_funded: false,
            is_repaid: false,
            is_defaulted: false,
        }
    }

    #[test]
    fn test_repayment_due_floors_interest() {
        assert_eq!(repayment_due(3, 1).unwrap(), 3);
        assert_eq!(repayment_due(100, 5).unwrap(), 105);
        assert_eq!(repayment_due(199, 1).unwrap(), 200);
        assert_eq!(repayment_due(1_000, 0).unwrap(), 1_000);
    }

    #[test]
    fn test_repayment_due_overflow() {
        let result = repayment_due(Amount::MAX, 2);
        assert!(matches!(result, Err(Error::Overflow(_))));
    }

    #[test]
    fn test_status_derivation() {
        let mut loan = loan();
        assert_eq!(loan.status(), LoanStatus::Requested);

        loan.is_funded = true;
        loan.lender = Some(AccountId::new("lender"));
        assert_eq!(loan.status(), LoanStatus::Funded);

        loan.is_defaulted = true;
        assert_eq!(loan.status(), LoanStatus::Defaulted);
        assert!(loan.status().is_settled());
        assert!(!loan.holds_collateral());
    }

    #[test]
    fn test_unfunded_request_becomes_terminal_at_due_date() {
        let loan = loan();
        assert!(loan.is_fundable(99));
        assert!(!loan.is_terminal(99));

        assert!(!loan.is_fundable(100));
        assert!(loan.is_terminal(100));
        assert!(loan.holds_collateral());
    }

    #[test]
    fn test_holder_display() {
        assert_eq!(Holder::Escrow.to_string(), "escrow");
        assert_eq!(Holder::Account(AccountId::new("alice")).to_string(), "alice");
    }
}
