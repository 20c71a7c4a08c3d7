//! Loan Ledger
//!
//! Peer-to-peer collateralized lending ledger with native-value custody.
//!
//! # Architecture
//!
//! - **Single Writer**: One actor task owns all state; calls are serialized
//! - **Plan then Apply**: Every guard runs before any state changes
//! - **Atomic Commit**: Record, balances and events land in one RocksDB batch
//! - **Event Fan-out**: Committed events are broadcast to subscribers
//!
//! # Invariants
//!
//! - Custody: escrow == Σ(collateral) of loans neither repaid nor defaulted
//! - Conservation: Σ(balances) + escrow == genesis allocation
//! - Dense ids: loan ids are 0, 1, 2, ... and never reused
//! - Terminal: repaid and defaulted loans accept no further operation

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod types;
pub mod error;
pub mod vault;
pub mod clock;
pub mod book;
pub mod storage;
pub mod actor;
pub mod ledger;
pub mod config;
pub mod metrics;

// Re-exports
pub use error::{Error, ExpiryStage, Result};
pub use types::{
    AccountId, Amount, EventRecord, Holder, InterestRate, Loan, LoanEvent, LoanId, LoanStatus,
    Operation, Receipt, Timestamp, Transfer,
};
pub use book::LoanBook;
pub use clock::{Clock, ManualClock, SystemClock};
pub use storage::Storage;
pub use ledger::LoanLedger;
pub use config::Config;
