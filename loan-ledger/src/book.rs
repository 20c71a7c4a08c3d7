//! Loan book: the lifecycle state machine
//!
//! Every operation runs in two phases:
//!
//! 1. `plan_*` evaluates the guards against the current book and returns a
//!    [`Transition`] carrying the new record, the emitted events and the
//!    settled balances. Nothing is mutated.
//! 2. [`LoanBook::apply`] installs the transition once storage has
//!    committed it.
//!
//! A rejected plan leaves no trace. Within a transition the record
//! mutation and event come first and payouts last.
//!
//! ```text
//!  Requested ──fund (now < due)──▶ Funded ──repay (now <= due)──▶ Repaid
//!      │                             │
//!      │ (now >= due, unfunded)      └──claim (now > due)──▶ Defaulted
//!      ▼
//!  stranded: collateral stays in escrow
//! ```

use crate::{
    error::{Error, ExpiryStage, Result},
    types::{
        AccountId, Amount, EventRecord, InterestRate, Loan, LoanEvent, LoanId, Operation,
        Receipt, Timestamp, Transfer,
    },
    vault::{Settlement, Vault},
};
use std::collections::HashMap;
use uuid::Uuid;

/// Fields that make two untouched requests identical
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RequestKey {
    borrower: AccountId,
    collateral_amount: Amount,
    loan_amount: Amount,
    interest_rate: InterestRate,
}

impl RequestKey {
    fn of(loan: &Loan) -> Self {
        Self {
            borrower: loan.borrower.clone(),
            collateral_amount: loan.collateral_amount,
            loan_amount: loan.loan_amount,
            interest_rate: loan.interest_rate,
        }
    }
}

/// Fully evaluated effect of one operation
#[derive(Debug, Clone)]
pub struct Transition {
    /// Operation that produced it
    pub operation: Operation,

    /// Record after the transition
    pub loan: Loan,

    /// Id counter after the transition
    pub next_id: LoanId,

    /// Events to emit
    pub events: Vec<EventRecord>,

    /// Value movements, in execution order
    pub transfers: Vec<Transfer>,

    /// Balances after the transfers
    pub settlement: Settlement,

    /// Event sequence counter after the transition
    pub next_sequence: u64,
}

impl Transition {
    /// Caller-facing summary
    pub fn into_receipt(self) -> Receipt {
        Receipt {
            operation: self.operation,
            loan: self.loan,
            events: self.events,
            transfers: self.transfers,
        }
    }
}

/// In-memory loan records, custody balances and the open-request index
#[derive(Debug, Default)]
pub struct LoanBook {
    loans: Vec<Loan>,
    vault: Vault,
    open_requests: HashMap<RequestKey, LoanId>,
    next_sequence: u64,
}

impl LoanBook {
    /// Empty book over an existing vault
    pub fn new(vault: Vault) -> Self {
        Self {
            vault,
            ..Default::default()
        }
    }

    /// Rebuild from persisted records
    pub fn from_parts(loans: Vec<Loan>, vault: Vault, next_sequence: u64) -> Result<Self> {
        for (position, loan) in loans.iter().enumerate() {
            if loan.id != position as LoanId {
                return Err(Error::InvariantViolation(format!(
                    "loan at position {} carries id {}",
                    position, loan.id
                )));
            }
            check_record(loan)?;
        }

        let open_requests = loans
            .iter()
            .filter(|loan| loan.is_untouched())
            .map(|loan| (RequestKey::of(loan), loan.id))
            .collect();

        Ok(Self {
            loans,
            vault,
            open_requests,
            next_sequence,
        })
    }

    /// Id the next request will receive
    pub fn next_id(&self) -> LoanId {
        self.loans.len() as LoanId
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.loans.len()
    }

    /// True before the first request
    pub fn is_empty(&self) -> bool {
        self.loans.is_empty()
    }

    /// Record by id
    pub fn get(&self, loan_id: LoanId) -> Option<&Loan> {
        usize::try_from(loan_id)
            .ok()
            .and_then(|index| self.loans.get(index))
    }

    /// Record by id, `NotFound` when out of range
    pub fn loan(&self, loan_id: LoanId) -> Result<&Loan> {
        self.get(loan_id).ok_or(Error::NotFound(loan_id))
    }

    /// All records in id order
    pub fn loans(&self) -> &[Loan] {
        &self.loans
    }

    /// Custody balances
    pub fn vault(&self) -> &Vault {
        &self.vault
    }

    /// Sequence number of the next event
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    /// Untouched request with the same borrower, amount and rate, if any.
    ///
    /// Due date does not participate. Records stay in the index until
    /// funded, so a request that expired unfunded still blocks its twin.
    pub fn find_duplicate(
        &self,
        borrower: &AccountId,
        amount: Amount,
        interest_rate: InterestRate,
    ) -> Option<LoanId> {
        let key = RequestKey {
            borrower: borrower.clone(),
            collateral_amount: amount,
            loan_amount: amount,
            interest_rate,
        };
        self.open_requests.get(&key).copied()
    }

    /// Lock `deposit` as collateral and open a request for the same principal
    pub fn plan_request(
        &self,
        caller: &AccountId,
        interest_rate: InterestRate,
        duration: u64,
        deposit: Amount,
        now: Timestamp,
    ) -> Result<Transition> {
        if deposit == 0 {
            return Err(Error::InvalidAmount);
        }

        if let Some(existing) = self.find_duplicate(caller, deposit, interest_rate) {
            return Err(Error::DuplicateRequest { existing });
        }

        let due_date = now.checked_add(duration).ok_or_else(|| {
            Error::Overflow(format!("due date {} + {}", now, duration))
        })?;

        let loan = Loan {
            id: self.next_id(),
            borrower: caller.clone(),
            lender: None,
            collateral_amount: deposit,
            loan_amount: deposit,
            interest_rate,
            due_date,
            is_funded: false,
            is_repaid: false,
            is_defaulted: false,
        };

        let event = LoanEvent::LoanRequested {
            borrower: loan.borrower.clone(),
            collateral_amount: loan.collateral_amount,
            loan_amount: loan.loan_amount,
            interest_rate: loan.interest_rate,
            due_date: loan.due_date,
        };
        let transfers = vec![Transfer::intake(caller, deposit)];

        self.transition(Operation::Request, loan, vec![event], transfers, now)
    }

    /// Supply the principal of an open request and pay it to the borrower
    pub fn plan_fund(
        &self,
        caller: &AccountId,
        loan_id: LoanId,
        value: Amount,
        now: Timestamp,
    ) -> Result<Transition> {
        let loan = self.loan(loan_id)?;

        if loan.is_funded {
            let lender = loan.lender.clone().ok_or_else(|| {
                Error::InvariantViolation(format!("funded loan {} has no lender", loan_id))
            })?;
            return Err(Error::AlreadyFunded { loan_id, lender });
        }

        if value != loan.loan_amount {
            return Err(Error::WrongAmount {
                loan_id,
                expected: loan.loan_amount,
                supplied: value,
            });
        }

        if !loan.is_fundable(now) {
            return Err(Error::Expired {
                loan_id,
                stage: ExpiryStage::Funding,
            });
        }

        let mut funded = loan.clone();
        funded.lender = Some(caller.clone());
        funded.is_funded = true;

        let transfers = vec![
            Transfer::intake(caller, value),
            Transfer::payout(&loan.borrower, value),
        ];

        self.transition(
            Operation::Fund,
            funded,
            vec![LoanEvent::LoanFunded { id: loan_id }],
            transfers,
            now,
        )
    }

    /// Pay principal plus flat interest to the lender and release collateral
    pub fn plan_repay(
        &self,
        caller: &AccountId,
        loan_id: LoanId,
        value: Amount,
        now: Timestamp,
    ) -> Result<Transition> {
        let loan = self.loan(loan_id)?;

        if caller != &loan.borrower {
            return Err(Error::NotBorrower {
                loan_id,
                caller: caller.clone(),
            });
        }

        if !loan.is_funded {
            return Err(Error::NotFunded(loan_id));
        }

        if now > loan.due_date {
            return Err(Error::Expired {
                loan_id,
                stage: ExpiryStage::Repayment,
            });
        }

        if loan.is_repaid {
            return Err(Error::AlreadyRepaid(loan_id));
        }

        let due = loan.repayment_due()?;
        if value != due {
            return Err(Error::WrongAmount {
                loan_id,
                expected: due,
                supplied: value,
            });
        }

        let lender = funded_lender(loan)?;

        let mut repaid = loan.clone();
        repaid.is_repaid = true;

        let transfers = vec![
            Transfer::intake(caller, value),
            Transfer::payout(lender, value),
            Transfer::payout(&loan.borrower, loan.collateral_amount),
        ];

        self.transition(
            Operation::Repay,
            repaid,
            vec![LoanEvent::LoanRepaid { id: loan_id }],
            transfers,
            now,
        )
    }

    /// Seize the collateral of an overdue, unrepaid loan
    pub fn plan_claim(
        &self,
        caller: &AccountId,
        loan_id: LoanId,
        now: Timestamp,
    ) -> Result<Transition> {
        let loan = self.loan(loan_id)?;

        if loan.lender.as_ref() != Some(caller) {
            return Err(Error::NotLender {
                loan_id,
                caller: caller.clone(),
            });
        }

        if !loan.is_funded {
            return Err(Error::NotFunded(loan_id));
        }

        if loan.is_repaid {
            return Err(Error::AlreadyRepaid(loan_id));
        }

        if now <= loan.due_date {
            return Err(Error::NotYetDue {
                loan_id,
                due_date: loan.due_date,
            });
        }

        if loan.is_defaulted {
            return Err(Error::AlreadyClaimed(loan_id));
        }

        let lender = funded_lender(loan)?;

        let mut defaulted = loan.clone();
        defaulted.is_defaulted = true;

        let event = LoanEvent::CollateralClaimed {
            borrower: loan.borrower.clone(),
            lender: lender.clone(),
            collateral_amount: loan.collateral_amount,
        };
        let transfers = vec![Transfer::payout(lender, loan.collateral_amount)];

        self.transition(Operation::Claim, defaulted, vec![event], transfers, now)
    }

    /// Install a committed transition
    pub fn apply(&mut self, transition: &Transition) {
        let loan = transition.loan.clone();

        match transition.operation {
            Operation::Request => {
                self.open_requests.insert(RequestKey::of(&loan), loan.id);
            }
            Operation::Fund => {
                self.open_requests.remove(&RequestKey::of(&loan));
            }
            Operation::Repay | Operation::Claim => {}
        }

        match usize::try_from(loan.id).ok().and_then(|index| self.loans.get_mut(index)) {
            Some(slot) => *slot = loan,
            None => self.loans.push(loan),
        }

        self.vault.apply(&transition.settlement);
        self.next_sequence = transition.next_sequence;
    }

    /// Escrow must equal the collateral of every loan not yet repaid or defaulted
    pub fn check_custody(&self) -> Result<()> {
        let locked = self
            .loans
            .iter()
            .filter(|loan| loan.holds_collateral())
            .try_fold(0 as Amount, |acc, loan| acc.checked_add(loan.collateral_amount))
            .ok_or_else(|| Error::Overflow("locked collateral".to_string()))?;

        if locked != self.vault.escrow() {
            return Err(Error::InvariantViolation(format!(
                "escrow holds {} but loans lock {}",
                self.vault.escrow(),
                locked
            )));
        }

        Ok(())
    }

    fn transition(
        &self,
        operation: Operation,
        loan: Loan,
        events: Vec<LoanEvent>,
        transfers: Vec<Transfer>,
        now: Timestamp,
    ) -> Result<Transition> {
        check_record(&loan)?;
        let settlement = self.vault.settle(&transfers)?;

        let next_sequence = self
            .next_sequence
            .checked_add(events.len() as u64)
            .ok_or_else(|| Error::Overflow("event sequence".to_string()))?;

        let events: Vec<EventRecord> = events
            .into_iter()
            .zip(self.next_sequence..next_sequence)
            .map(|(event, sequence)| EventRecord {
                event_id: Uuid::now_v7(),
                sequence,
                loan_id: loan.id,
                timestamp: now,
                event,
            })
            .collect();

        let next_id = if operation == Operation::Request {
            loan.id + 1
        } else {
            self.next_id()
        };

        Ok(Transition {
            operation,
            loan,
            next_id,
            events,
            transfers,
            settlement,
            next_sequence,
        })
    }
}

fn funded_lender(loan: &Loan) -> Result<&AccountId> {
    loan.lender.as_ref().ok_or_else(|| {
        Error::InvariantViolation(format!("funded loan {} has no lender", loan.id))
    })
}

fn check_record(loan: &Loan) -> Result<()> {
    if loan.loan_amount != loan.collateral_amount {
        return Err(Error::InvariantViolation(format!(
            "loan {} principal {} differs from collateral {}",
            loan.id, loan.loan_amount, loan.collateral_amount
        )));
    }
    if loan.is_repaid && loan.is_defaulted {
        return Err(Error::InvariantViolation(format!(
            "loan {} is both repaid and defaulted",
            loan.id
        )));
    }
    if (loan.is_repaid || loan.is_defaulted) && !loan.is_funded {
        return Err(Error::InvariantViolation(format!(
            "loan {} settled without funding",
            loan.id
        )));
    }
    if loan.is_funded != loan.lender.is_some() {
        return Err(Error::InvariantViolation(format!(
            "loan {} lender does not match funding flag",
            loan.id
        )));
    }
    Ok(())
}
