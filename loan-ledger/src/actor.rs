//! Actor-based concurrency for the loan ledger
//!
//! This module implements the single-writer pattern using a Tokio actor:
//! - One task owns the loan book and the storage handle
//! - Guards, storage commit and in-memory apply of one call run back to
//!   back, never interleaved with another call
//! - Async message passing with backpressure (bounded mailbox)
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │               LedgerHandle (Clone)                    │
//! │         Sends messages to actor mailbox              │
//! └─────────────────────┬────────────────────────────────┘
//!                       │
//!                       │ mpsc::channel (bounded)
//!                       ▼
//! ┌──────────────────────────────────────────────────────┐
//! │              LedgerActor (Single Task)                │
//! │  ┌────────────────────────────────────────────────┐  │
//! │  │ now = clock.now()                              │  │
//! │  │ transition = book.plan_*(.., now)?             │  │
//! │  └────────────────────────────────────────────────┘  │
//! │                       │                               │
//! │                       ▼                               │
//! │      Storage::commit() (one RocksDB WriteBatch)       │
//! │                       │                               │
//! │                       ▼                               │
//! │      book.apply() ──▶ broadcast events                │
//! └───────────────────────────────────────────────────────┘
//! ```

use crate::{
    book::{LoanBook, Transition},
    clock::Clock,
    metrics::Metrics,
    types::{AccountId, Amount, EventRecord, InterestRate, Loan, LoanId, Operation, Receipt},
    Error, Result, Storage,
};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, mpsc, oneshot};

/// Message sent to the ledger actor
#[derive(Debug)]
pub enum LedgerMessage {
    /// Lock a deposit and open a loan request
    RequestLoan {
        caller: AccountId,
        interest_rate: InterestRate,
        duration: u64,
        value: Amount,
        response: oneshot::Sender<Result<Receipt>>,
    },

    /// Fund an open request
    FundLoan {
        caller: AccountId,
        loan_id: LoanId,
        value: Amount,
        response: oneshot::Sender<Result<Receipt>>,
    },

    /// Repay a funded loan
    RepayLoan {
        caller: AccountId,
        loan_id: LoanId,
        value: Amount,
        response: oneshot::Sender<Result<Receipt>>,
    },

    /// Claim collateral of an overdue loan
    ClaimCollateral {
        caller: AccountId,
        loan_id: LoanId,
        response: oneshot::Sender<Result<Receipt>>,
    },

    /// Get loan record
    GetLoan {
        loan_id: LoanId,
        response: oneshot::Sender<Result<Loan>>,
    },

    /// Get id counter
    NextId {
        response: oneshot::Sender<Result<LoanId>>,
    },

    /// Get events of a loan
    GetLoanEvents {
        loan_id: LoanId,
        response: oneshot::Sender<Result<Vec<EventRecord>>>,
    },

    /// Get account balance
    BalanceOf {
        account: AccountId,
        response: oneshot::Sender<Result<Amount>>,
    },

    /// Get escrow balance
    EscrowBalance {
        response: oneshot::Sender<Result<Amount>>,
    },

    /// Audit custody and supply invariants
    CheckCustody {
        response: oneshot::Sender<Result<()>>,
    },

    /// Shutdown actor, replying once storage is closed
    Shutdown {
        response: oneshot::Sender<Result<()>>,
    },
}

/// Actor that processes ledger messages
#[derive(Debug)]
pub struct LedgerActor {
    /// In-memory state
    book: LoanBook,

    /// Storage backend
    storage: Storage,

    /// Time source, read once per operation
    clock: Arc<dyn Clock>,

    /// Metrics
    metrics: Metrics,

    /// Live event fan-out
    events: broadcast::Sender<EventRecord>,

    /// Total value allocated at genesis
    genesis_supply: Amount,

    /// Mailbox for incoming messages
    mailbox: mpsc::Receiver<LedgerMessage>,
}

impl LedgerActor {
    /// Create new actor
    pub fn new(
        book: LoanBook,
        storage: Storage,
        clock: Arc<dyn Clock>,
        metrics: Metrics,
        events: broadcast::Sender<EventRecord>,
        mailbox: mpsc::Receiver<LedgerMessage>,
    ) -> Result<Self> {
        let genesis_supply = storage.genesis_supply()?;
        Ok(Self {
            book,
            storage,
            clock,
            metrics,
            events,
            genesis_supply,
            mailbox,
        })
    }

    /// Run the actor event loop
    pub async fn run(mut self) {
        let mut shutdown_ack = None;

        while let Some(msg) = self.mailbox.recv().await {
            match msg {
                LedgerMessage::Shutdown { response } => {
                    shutdown_ack = Some(response);
                    break;
                }
                msg => self.handle_message(msg),
            }
        }

        let LedgerActor { storage, .. } = self;
        let result = storage.close();
        if let Err(e) = &result {
            tracing::error!("Error closing storage: {}", e);
        }

        if let Some(response) = shutdown_ack {
            let _ = response.send(result);
        }
    }

    /// Handle a single message
    fn handle_message(&mut self, msg: LedgerMessage) {
        match msg {
            LedgerMessage::RequestLoan {
                caller,
                interest_rate,
                duration,
                value,
                response,
            } => {
                let result = self.execute(Operation::Request, |book, now| {
                    book.plan_request(&caller, interest_rate, duration, value, now)
                });
                let _ = response.send(result);
            }

            LedgerMessage::FundLoan {
                caller,
                loan_id,
                value,
                response,
            } => {
                let result = self.execute(Operation::Fund, |book, now| {
                    book.plan_fund(&caller, loan_id, value, now)
                });
                let _ = response.send(result);
            }

            LedgerMessage::RepayLoan {
                caller,
                loan_id,
                value,
                response,
            } => {
                let result = self.execute(Operation::Repay, |book, now| {
                    book.plan_repay(&caller, loan_id, value, now)
                });
                let _ = response.send(result);
            }

            LedgerMessage::ClaimCollateral {
                caller,
                loan_id,
                response,
            } => {
                let result = self.execute(Operation::Claim, |book, now| {
                    book.plan_claim(&caller, loan_id, now)
                });
                let _ = response.send(result);
            }

            LedgerMessage::GetLoan { loan_id, response } => {
                let result = self.book.loan(loan_id).cloned();
                let _ = response.send(result);
            }

            LedgerMessage::NextId { response } => {
                let _ = response.send(Ok(self.book.next_id()));
            }

            LedgerMessage::GetLoanEvents { loan_id, response } => {
                let result = self
                    .book
                    .loan(loan_id)
                    .and_then(|_| self.storage.get_loan_events(loan_id));
                let _ = response.send(result);
            }

            LedgerMessage::BalanceOf { account, response } => {
                let _ = response.send(Ok(self.book.vault().balance_of(&account)));
            }

            LedgerMessage::EscrowBalance { response } => {
                let _ = response.send(Ok(self.book.vault().escrow()));
            }

            LedgerMessage::CheckCustody { response } => {
                let _ = response.send(self.check_custody());
            }

            LedgerMessage::Shutdown { .. } => {
                // Handled in main loop
            }
        }
    }

    /// Plan, commit and apply one mutating operation
    fn execute(
        &mut self,
        operation: Operation,
        plan: impl FnOnce(&LoanBook, u64) -> Result<Transition>,
    ) -> Result<Receipt> {
        let started = Instant::now();
        let now = self.clock.now();

        let result = plan(&self.book, now).and_then(|transition| {
            self.storage.commit(&transition)?;
            self.book.apply(&transition);
            Ok(transition)
        });
        self.metrics.record_duration(started.elapsed().as_secs_f64());

        match result {
            Ok(transition) => {
                self.metrics.record_committed(operation);
                self.metrics.set_escrow(self.book.vault().escrow());

                tracing::info!(
                    loan_id = transition.loan.id,
                    operation = %operation,
                    status = %transition.loan.status(),
                    "Loan transition committed"
                );

                for record in &transition.events {
                    // No subscribers is not an error
                    let _ = self.events.send(record.clone());
                }

                Ok(transition.into_receipt())
            }
            Err(e) => {
                self.metrics.record_rejected(e.kind());
                if e.is_rejection() {
                    tracing::warn!(operation = %operation, kind = e.kind(), "Loan operation rejected: {}", e);
                } else {
                    tracing::error!(operation = %operation, kind = e.kind(), "Loan operation failed: {}", e);
                }
                Err(e)
            }
        }
    }

    fn check_custody(&self) -> Result<()> {
        self.book.check_custody()?;

        let supply = self.book.vault().total_supply()?;
        if supply != self.genesis_supply {
            return Err(Error::InvariantViolation(format!(
                "total supply {} differs from genesis allocation {}",
                supply, self.genesis_supply
            )));
        }

        Ok(())
    }
}

/// Handle for sending messages to the actor
#[derive(Clone, Debug)]
pub struct LedgerHandle {
    sender: mpsc::Sender<LedgerMessage>,
}

impl LedgerHandle {
    /// Create new handle
    pub fn new(sender: mpsc::Sender<LedgerMessage>) -> Self {
        Self { sender }
    }

    async fn call<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T>>) -> LedgerMessage,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(build(tx))
            .await
            .map_err(|_| Error::Concurrency("Actor mailbox closed".to_string()))?;

        rx.await
            .map_err(|_| Error::Concurrency("Response channel closed".to_string()))?
    }

    /// Request a loan
    pub async fn request_loan(
        &self,
        caller: AccountId,
        interest_rate: InterestRate,
        duration: u64,
        value: Amount,
    ) -> Result<Receipt> {
        self.call(|response| LedgerMessage::RequestLoan {
            caller,
            interest_rate,
            duration,
            value,
            response,
        })
        .await
    }

    /// Fund a loan
    pub async fn fund_loan(&self, caller: AccountId, loan_id: LoanId, value: Amount) -> Result<Receipt> {
        self.call(|response| LedgerMessage::FundLoan {
            caller,
            loan_id,
            value,
            response,
        })
        .await
    }

    /// Repay a loan
    pub async fn repay_loan(&self, caller: AccountId, loan_id: LoanId, value: Amount) -> Result<Receipt> {
        self.call(|response| LedgerMessage::RepayLoan {
            caller,
            loan_id,
            value,
            response,
        })
        .await
    }

    /// Claim collateral
    pub async fn claim_collateral(&self, caller: AccountId, loan_id: LoanId) -> Result<Receipt> {
        self.call(|response| LedgerMessage::ClaimCollateral {
            caller,
            loan_id,
            response,
        })
        .await
    }

    /// Get loan record
    pub async fn get_loan(&self, loan_id: LoanId) -> Result<Loan> {
        self.call(|response| LedgerMessage::GetLoan { loan_id, response })
            .await
    }

    /// Get id counter
    pub async fn next_id(&self) -> Result<LoanId> {
        self.call(|response| LedgerMessage::NextId { response }).await
    }

    /// Get events of a loan
    pub async fn get_loan_events(&self, loan_id: LoanId) -> Result<Vec<EventRecord>> {
        self.call(|response| LedgerMessage::GetLoanEvents { loan_id, response })
            .await
    }

    /// Get account balance
    pub async fn balance_of(&self, account: AccountId) -> Result<Amount> {
        self.call(|response| LedgerMessage::BalanceOf { account, response })
            .await
    }

    /// Get escrow balance
    pub async fn escrow_balance(&self) -> Result<Amount> {
        self.call(|response| LedgerMessage::EscrowBalance { response })
            .await
    }

    /// Audit invariants
    pub async fn check_custody(&self) -> Result<()> {
        self.call(|response| LedgerMessage::CheckCustody { response })
            .await
    }

    /// Shutdown actor and wait for storage to close
    pub async fn shutdown(&self) -> Result<()> {
        self.call(|response| LedgerMessage::Shutdown { response })
            .await
    }
}

/// Spawn the ledger actor
pub fn spawn_ledger_actor(
    book: LoanBook,
    storage: Storage,
    clock: Arc<dyn Clock>,
    metrics: Metrics,
    events: broadcast::Sender<EventRecord>,
    mailbox_capacity: usize,
) -> Result<LedgerHandle> {
    let (tx, rx) = mpsc::channel(mailbox_capacity);
    let actor = LedgerActor::new(book, storage, clock, metrics, events, rx)?;

    tokio::spawn(async move {
        actor.run().await;
    });

    Ok(LedgerHandle::new(tx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::vault::Vault;
    use crate::Config;

    const T0: u64 = 1_700_000_000;

    struct Fixture {
        handle: LedgerHandle,
        clock: Arc<ManualClock>,
        metrics: Metrics,
        _temp: tempfile::TempDir,
    }

    fn spawn_test_actor() -> Fixture {
        let temp = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.data_dir = temp.path().to_path_buf();

        let storage = Storage::open(&config).unwrap();
        let mut vault = Vault::new();
        vault.credit(&AccountId::new("alice"), 100).unwrap();
        vault.credit(&AccountId::new("bob"), 100).unwrap();
        storage.write_genesis(&vault).unwrap();
        let book = storage.load_book().unwrap();

        let clock = Arc::new(ManualClock::new(T0));
        let metrics = Metrics::new().unwrap();
        let (events, _) = broadcast::channel(16);
        let handle = spawn_ledger_actor(book, storage, clock.clone(), metrics.clone(), events, 8)
            .unwrap();

        Fixture {
            handle,
            clock,
            metrics,
            _temp: temp,
        }
    }

    #[tokio::test]
    async fn test_actor_spawn_and_shutdown() {
        let fixture = spawn_test_actor();
        fixture.handle.shutdown().await.unwrap();

        // Mailbox is gone once the actor exits
        let err = fixture.handle.next_id().await.unwrap_err();
        assert!(matches!(err, Error::Concurrency(_)));
    }

    #[tokio::test]
    async fn test_actor_request_and_read() {
        let fixture = spawn_test_actor();
        let alice = AccountId::new("alice");

        let receipt = fixture
            .handle
            .request_loan(alice.clone(), 10, 60, 40)
            .await
            .unwrap();
        assert_eq!(receipt.loan.id, 0);
        assert_eq!(receipt.loan.due_date, T0 + 60);

        assert_eq!(fixture.handle.next_id().await.unwrap(), 1);
        assert_eq!(fixture.handle.balance_of(alice).await.unwrap(), 60);
        assert_eq!(fixture.handle.escrow_balance().await.unwrap(), 40);
        assert_eq!(fixture.handle.get_loan_events(0).await.unwrap().len(), 1);
        fixture.handle.check_custody().await.unwrap();

        assert_eq!(fixture.metrics.requests_total.get(), 1);
        assert_eq!(fixture.metrics.escrow_balance.get(), 40);

        fixture.handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_actor_reads_clock_per_call() {
        let fixture = spawn_test_actor();
        let alice = AccountId::new("alice");
        let bob = AccountId::new("bob");

        fixture.handle.request_loan(alice, 10, 60, 40).await.unwrap();
        fixture.clock.advance(60);

        let err = fixture.handle.fund_loan(bob, 0, 40).await.unwrap_err();
        assert!(matches!(err, Error::Expired { .. }));
        assert_eq!(
            fixture.metrics.rejected_total.with_label_values(&["expired"]).get(),
            1
        );

        fixture.handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_actor_serializes_concurrent_requests() {
        let fixture = spawn_test_actor();

        // Same borrower, same terms, sent concurrently: exactly one wins
        let calls = (0..8).map(|_| {
            let handle = fixture.handle.clone();
            tokio::spawn(async move {
                handle
                    .request_loan(AccountId::new("alice"), 5, 60, 10)
                    .await
            })
        });

        let mut committed = 0;
        let mut duplicates = 0;
        for call in calls.collect::<Vec<_>>() {
            match call.await.unwrap() {
                Ok(_) => committed += 1,
                Err(Error::DuplicateRequest { existing: 0 }) => duplicates += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }

        assert_eq!(committed, 1);
        assert_eq!(duplicates, 7);
        assert_eq!(fixture.handle.next_id().await.unwrap(), 1);

        fixture.handle.shutdown().await.unwrap();
    }
}
