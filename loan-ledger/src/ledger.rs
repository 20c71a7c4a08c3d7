//! Main ledger orchestration layer
//!
//! This module ties together storage, the loan book and the actor
//! into a high-level API for collateralized peer-to-peer loans.
//!
//! # Example
//!
//! ```no_run
//! use loan_ledger::{AccountId, Config, LoanLedger};
//!
//! #[tokio::main]
//! async fn main() -> loan_ledger::Result<()> {
//!     let mut config = Config::default();
//!     config.genesis.insert("alice".to_string(), 1_000);
//!     config.genesis.insert("bob".to_string(), 1_000);
//!
//!     let ledger = LoanLedger::open(config).await?;
//!     let alice = AccountId::new("alice");
//!     let bob = AccountId::new("bob");
//!
//!     let request = ledger.request_loan(&alice, 10, 3_600, 100).await?;
//!     ledger.fund_loan(&bob, request.loan.id, 100).await?;
//!     ledger.repay_loan(&alice, request.loan.id, 110).await?;
//!
//!     ledger.shutdown().await
//! }
//! ```

use crate::{
    actor::{spawn_ledger_actor, LedgerHandle},
    clock::{Clock, SystemClock},
    metrics::Metrics,
    types::{AccountId, Amount, EventRecord, InterestRate, Loan, LoanId, Receipt},
    vault::Vault,
    Config, Error, Result, Storage,
};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_stream::{wrappers::BroadcastStream, Stream, StreamExt};

/// Main ledger interface
#[derive(Debug)]
pub struct LoanLedger {
    /// Actor handle for async operations
    handle: LedgerHandle,

    /// Live event fan-out
    events: broadcast::Sender<EventRecord>,

    /// Metrics shared with the actor
    metrics: Metrics,

    /// Configuration
    config: Config,
}

impl LoanLedger {
    /// Open ledger with configuration, using wall-clock time
    pub async fn open(config: Config) -> Result<Self> {
        Self::open_with_clock(config, Arc::new(SystemClock)).await
    }

    /// Open ledger with an explicit time source
    pub async fn open_with_clock(config: Config, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;

        let storage = Storage::open(&config)?;

        if storage.is_fresh()? {
            let mut vault = Vault::new();
            for (account, balance) in config.genesis_accounts() {
                vault.credit(&account, balance)?;
            }
            storage.write_genesis(&vault)?;
        } else if !config.genesis.is_empty() {
            tracing::warn!(
                data_dir = %config.data_dir.display(),
                accounts = config.genesis.len(),
                "Data directory already initialized, genesis table ignored"
            );
        }

        let book = storage.load_book()?;
        book.check_custody()?;

        let metrics = Metrics::new()
            .map_err(|e| Error::Other(format!("Failed to register metrics: {}", e)))?;
        metrics.set_escrow(book.vault().escrow());

        let (events, _) = broadcast::channel(config.events.broadcast_capacity);

        let handle = spawn_ledger_actor(
            book,
            storage,
            clock,
            metrics.clone(),
            events.clone(),
            config.actor.mailbox_capacity,
        )?;

        tracing::info!(
            service = %config.service_name,
            version = %config.service_version,
            data_dir = %config.data_dir.display(),
            "Loan ledger opened"
        );

        Ok(Self {
            handle,
            events,
            metrics,
            config,
        })
    }

    /// Lock `value` as collateral and open a request for the same amount
    pub async fn request_loan(
        &self,
        caller: &AccountId,
        interest_rate: InterestRate,
        duration: u64,
        value: Amount,
    ) -> Result<Receipt> {
        self.handle
            .request_loan(caller.clone(), interest_rate, duration, value)
            .await
    }

    /// Fund an open request with exactly its loan amount
    pub async fn fund_loan(&self, caller: &AccountId, loan_id: LoanId, value: Amount) -> Result<Receipt> {
        self.handle.fund_loan(caller.clone(), loan_id, value).await
    }

    /// Repay a funded loan with exactly the amount due
    pub async fn repay_loan(&self, caller: &AccountId, loan_id: LoanId, value: Amount) -> Result<Receipt> {
        self.handle.repay_loan(caller.clone(), loan_id, value).await
    }

    /// Take the collateral of a funded loan past its due date
    pub async fn claim_collateral(&self, caller: &AccountId, loan_id: LoanId) -> Result<Receipt> {
        self.handle.claim_collateral(caller.clone(), loan_id).await
    }

    /// Get loan record
    pub async fn get_loan(&self, loan_id: LoanId) -> Result<Loan> {
        self.handle.get_loan(loan_id).await
    }

    /// Id the next request will receive (also the number of loans)
    pub async fn next_id(&self) -> Result<LoanId> {
        self.handle.next_id().await
    }

    /// Get loan events (full history, in emission order)
    pub async fn loan_events(&self, loan_id: LoanId) -> Result<Vec<EventRecord>> {
        self.handle.get_loan_events(loan_id).await
    }

    /// Get account balance
    pub async fn balance_of(&self, account: &AccountId) -> Result<Amount> {
        self.handle.balance_of(account.clone()).await
    }

    /// Get escrow balance
    pub async fn escrow_balance(&self) -> Result<Amount> {
        self.handle.escrow_balance().await
    }

    /// Verify escrow against locked collateral and supply against genesis
    pub async fn check_custody(&self) -> Result<()> {
        self.handle.check_custody().await
    }

    /// Subscribe to events committed from now on
    pub fn subscribe(&self) -> broadcast::Receiver<EventRecord> {
        self.events.subscribe()
    }

    /// Committed events as a stream; lagged gaps are skipped
    pub fn event_stream(&self) -> impl Stream<Item = EventRecord> {
        BroadcastStream::new(self.events.subscribe()).filter_map(|result| match result {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!("Event subscriber lagged: {}", e);
                None
            }
        })
    }

    /// Get metrics
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Get configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Shutdown ledger gracefully; storage is closed when this returns
    pub async fn shutdown(self) -> Result<()> {
        self.handle.shutdown().await?;
        tracing::info!("Loan ledger shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use tempfile::TempDir;

    const T0: u64 = 1_700_000_000;

    async fn open_test_ledger() -> (LoanLedger, Arc<ManualClock>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        config.genesis.insert("alice".to_string(), 1_000);
        config.genesis.insert("bob".to_string(), 1_000);

        let clock = Arc::new(ManualClock::new(T0));
        let ledger = LoanLedger::open_with_clock(config, clock.clone())
            .await
            .unwrap();
        (ledger, clock, temp_dir)
    }

    #[tokio::test]
    async fn test_ledger_open() {
        let (ledger, _clock, _temp) = open_test_ledger().await;
        assert_eq!(ledger.next_id().await.unwrap(), 0);
        assert_eq!(ledger.balance_of(&AccountId::new("alice")).await.unwrap(), 1_000);
        assert_eq!(ledger.balance_of(&AccountId::new("nobody")).await.unwrap(), 0);
        assert_eq!(ledger.escrow_balance().await.unwrap(), 0);
        ledger.check_custody().await.unwrap();
        ledger.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_ledger_rejects_invalid_config() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        config.events.broadcast_capacity = 0;

        let err = LoanLedger::open(config).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn test_subscribe_receives_committed_events() {
        let (ledger, _clock, _temp) = open_test_ledger().await;
        let alice = AccountId::new("alice");
        let bob = AccountId::new("bob");
        let mut events = ledger.subscribe();

        ledger.request_loan(&alice, 10, 60, 100).await.unwrap();
        // Rejected calls emit nothing
        ledger.fund_loan(&bob, 0, 99).await.unwrap_err();
        ledger.fund_loan(&bob, 0, 100).await.unwrap();

        let first = events.recv().await.unwrap();
        let second = events.recv().await.unwrap();
        assert_eq!(first.event.name(), "LoanRequested");
        assert_eq!(second.event.name(), "LoanFunded");
        assert_eq!((first.sequence, second.sequence), (0, 1));
        assert!(events.try_recv().is_err());

        ledger.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_event_stream() {
        let (ledger, _clock, _temp) = open_test_ledger().await;
        let alice = AccountId::new("alice");
        let stream = ledger.event_stream();
        tokio::pin!(stream);

        let receipt = ledger.request_loan(&alice, 0, 60, 10).await.unwrap();
        let record = stream.next().await.unwrap();
        assert_eq!(record, receipt.events[0]);

        ledger.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_genesis_ignored_on_reopen() {
        let (ledger, _clock, temp_dir) = open_test_ledger().await;
        ledger.shutdown().await.unwrap();

        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        config.genesis.insert("mallory".to_string(), 1_000_000);

        let reopened = LoanLedger::open(config).await.unwrap();
        assert_eq!(reopened.balance_of(&AccountId::new("mallory")).await.unwrap(), 0);
        assert_eq!(reopened.balance_of(&AccountId::new("alice")).await.unwrap(), 1_000);
        reopened.check_custody().await.unwrap();
        reopened.shutdown().await.unwrap();
    }
}
