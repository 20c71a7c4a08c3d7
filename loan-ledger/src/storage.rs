//! Storage layer using RocksDB
//!
//! # Column Families
//!
//! - `loans` - Loan records (key: loan_id, big-endian)
//! - `balances` - Account balances (key: account id bytes)
//! - `events` - Append-only event log (key: sequence, big-endian)
//! - `indices` - Secondary index loan_id || sequence -> empty
//! - `meta` - Counters and escrow balance
//!
//! Every transition is written with a single `WriteBatch`, so a record
//! never becomes visible without its balances and events.

use crate::{
    book::{LoanBook, Transition},
    error::{Error, Result},
    types::{AccountId, Amount, EventRecord, Loan, LoanId},
    vault::Vault,
    Config,
};
use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, DBCompactionStyle, Direction, IteratorMode, Options,
    WriteBatch, DB,
};
use std::collections::HashMap;

/// Column family names
const CF_LOANS: &str = "loans";
const CF_BALANCES: &str = "balances";
const CF_EVENTS: &str = "events";
const CF_INDICES: &str = "indices";
const CF_META: &str = "meta";

/// Meta keys
const META_NEXT_ID: &[u8] = b"next_id";
const META_NEXT_SEQUENCE: &[u8] = b"next_sequence";
const META_ESCROW: &[u8] = b"escrow";
const META_GENESIS: &[u8] = b"genesis";

/// Storage wrapper for RocksDB
pub struct Storage {
    db: DB,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("path", &self.db.path())
            .finish()
    }
}

impl Storage {
    /// Open or create database
    pub fn open(config: &Config) -> Result<Self> {
        let path = &config.data_dir;

        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        db_opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.rocksdb.max_write_buffer_number);
        db_opts.set_max_background_jobs(config.rocksdb.max_background_jobs);
        db_opts.set_compaction_style(DBCompactionStyle::Level);

        if config.rocksdb.enable_statistics {
            db_opts.enable_statistics();
        }

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_LOANS, Self::cf_options_lz4()),
            ColumnFamilyDescriptor::new(CF_BALANCES, Self::cf_options_lz4()),
            ColumnFamilyDescriptor::new(CF_EVENTS, Self::cf_options_events()),
            ColumnFamilyDescriptor::new(CF_INDICES, Self::cf_options_indices()),
            ColumnFamilyDescriptor::new(CF_META, Options::default()),
        ];

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        tracing::info!(path = ?path, "Opened loan ledger storage");

        Ok(Self { db })
    }

    // Column family options

    fn cf_options_lz4() -> Options {
        let mut opts = Options::default();
        // Read on every open, use LZ4 for speed
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts
    }

    fn cf_options_events() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
        opts.set_bottommost_compression_type(rocksdb::DBCompressionType::Zstd);
        opts
    }

    fn cf_options_indices() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        let mut block_opts = rocksdb::BlockBasedOptions::default();
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);
        opts
    }

    fn cf_handle(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", name)))
    }

    // Genesis

    /// True until genesis balances have been written
    pub fn is_fresh(&self) -> Result<bool> {
        let cf = self.cf_handle(CF_META)?;
        Ok(self.db.get_cf(cf, META_GENESIS)?.is_none())
    }

    /// Write initial balances and zeroed counters (atomic)
    pub fn write_genesis(&self, vault: &Vault) -> Result<()> {
        let mut batch = WriteBatch::default();

        let cf_balances = self.cf_handle(CF_BALANCES)?;
        for (account, balance) in vault.balances() {
            batch.put_cf(cf_balances, account.as_str().as_bytes(), bincode::serialize(balance)?);
        }

        let cf_meta = self.cf_handle(CF_META)?;
        batch.put_cf(cf_meta, META_NEXT_ID, bincode::serialize(&0u64)?);
        batch.put_cf(cf_meta, META_NEXT_SEQUENCE, bincode::serialize(&0u64)?);
        batch.put_cf(cf_meta, META_ESCROW, bincode::serialize(&vault.escrow())?);
        batch.put_cf(cf_meta, META_GENESIS, bincode::serialize(&vault.total_supply()?)?);

        self.db.write(batch)?;

        tracing::info!(accounts = vault.balances().len(), "Genesis balances written");

        Ok(())
    }

    // Transitions

    /// Persist a transition: record, counters, balances, events and indices (atomic)
    pub fn commit(&self, transition: &Transition) -> Result<()> {
        let mut batch = WriteBatch::default();

        // 1. Loan record
        let cf_loans = self.cf_handle(CF_LOANS)?;
        batch.put_cf(
            cf_loans,
            transition.loan.id.to_be_bytes(),
            bincode::serialize(&transition.loan)?,
        );

        // 2. Balances
        let cf_balances = self.cf_handle(CF_BALANCES)?;
        for (account, balance) in &transition.settlement.balances {
            batch.put_cf(cf_balances, account.as_str().as_bytes(), bincode::serialize(balance)?);
        }

        // 3. Events and per-loan index
        let cf_events = self.cf_handle(CF_EVENTS)?;
        let cf_indices = self.cf_handle(CF_INDICES)?;
        for record in &transition.events {
            batch.put_cf(cf_events, record.sequence.to_be_bytes(), bincode::serialize(record)?);
            batch.put_cf(
                cf_indices,
                Self::index_key_loan_event(record.loan_id, Some(record.sequence)),
                b"",
            );
        }

        // 4. Counters and escrow
        let cf_meta = self.cf_handle(CF_META)?;
        batch.put_cf(cf_meta, META_NEXT_ID, bincode::serialize(&transition.next_id)?);
        batch.put_cf(
            cf_meta,
            META_NEXT_SEQUENCE,
            bincode::serialize(&transition.next_sequence)?,
        );
        batch.put_cf(
            cf_meta,
            META_ESCROW,
            bincode::serialize(&transition.settlement.escrow)?,
        );

        self.db.write(batch)?;

        tracing::debug!(
            loan_id = transition.loan.id,
            operation = %transition.operation,
            events = transition.events.len(),
            "Transition committed"
        );

        Ok(())
    }

    // Loading

    /// Rebuild the in-memory book from disk
    pub fn load_book(&self) -> Result<LoanBook> {
        let cf_loans = self.cf_handle(CF_LOANS)?;
        let mut loans = Vec::new();
        for item in self.db.iterator_cf(cf_loans, IteratorMode::Start) {
            let (_, value) = item?;
            let loan: Loan = bincode::deserialize(&value)?;
            loans.push(loan);
        }

        let cf_balances = self.cf_handle(CF_BALANCES)?;
        let mut balances = HashMap::new();
        for item in self.db.iterator_cf(cf_balances, IteratorMode::Start) {
            let (key, value) = item?;
            let account = String::from_utf8(key.to_vec())
                .map_err(|e| Error::Storage(format!("Invalid account key: {}", e)))?;
            let balance: Amount = bincode::deserialize(&value)?;
            balances.insert(AccountId::new(account), balance);
        }

        let next_id: LoanId = self.get_meta(META_NEXT_ID)?.unwrap_or(0);
        if next_id != loans.len() as LoanId {
            return Err(Error::InvariantViolation(format!(
                "next_id {} but {} loan records stored",
                next_id,
                loans.len()
            )));
        }

        let escrow: Amount = self.get_meta(META_ESCROW)?.unwrap_or(0);
        let next_sequence: u64 = self.get_meta(META_NEXT_SEQUENCE)?.unwrap_or(0);

        tracing::info!(loans = loans.len(), next_sequence, "Loan book loaded");

        LoanBook::from_parts(loans, Vault::from_parts(balances, escrow), next_sequence)
    }

    /// Total value allocated at genesis
    pub fn genesis_supply(&self) -> Result<Amount> {
        Ok(self.get_meta(META_GENESIS)?.unwrap_or(0))
    }

    fn get_meta<T: serde::de::DeserializeOwned>(&self, key: &[u8]) -> Result<Option<T>> {
        let cf = self.cf_handle(CF_META)?;
        match self.db.get_cf(cf, key)? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    // Reads

    /// Get event by sequence number
    pub fn get_event(&self, sequence: u64) -> Result<EventRecord> {
        let cf = self.cf_handle(CF_EVENTS)?;

        let value = self
            .db
            .get_cf(cf, sequence.to_be_bytes())?
            .ok_or_else(|| Error::Storage(format!("Event {} not found", sequence)))?;

        Ok(bincode::deserialize(&value)?)
    }

    /// Get events of a loan in emission order (via index)
    pub fn get_loan_events(&self, loan_id: LoanId) -> Result<Vec<EventRecord>> {
        let cf_indices = self.cf_handle(CF_INDICES)?;

        let prefix = Self::index_key_loan_event(loan_id, None);
        let iter = self
            .db
            .iterator_cf(cf_indices, IteratorMode::From(&prefix, Direction::Forward));

        let mut events = Vec::new();
        for item in iter {
            let (key, _) = item?;
            if !key.starts_with(&prefix) {
                break;
            }

            // Bytes 8..16 = sequence
            let sequence_bytes: [u8; 8] = key
                .get(8..16)
                .and_then(|bytes| bytes.try_into().ok())
                .ok_or_else(|| Error::Storage("Malformed loan event index key".to_string()))?;
            events.push(self.get_event(u64::from_be_bytes(sequence_bytes))?);
        }

        Ok(events)
    }

    fn index_key_loan_event(loan_id: LoanId, sequence: Option<u64>) -> Vec<u8> {
        let mut key = loan_id.to_be_bytes().to_vec();
        if let Some(sequence) = sequence {
            key.extend_from_slice(&sequence.to_be_bytes());
        }
        key
    }

    /// Close database (graceful shutdown)
    pub fn close(self) -> Result<()> {
        self.db.flush()?;
        drop(self.db);
        tracing::info!("RocksDB closed gracefully");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const T0: u64 = 1_700_000_000;

    fn test_config() -> (Config, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        (config, temp_dir)
    }

    fn genesis_vault() -> Vault {
        let mut vault = Vault::new();
        vault.credit(&AccountId::new("alice"), 500).unwrap();
        vault.credit(&AccountId::new("bob"), 500).unwrap();
        vault
    }

    #[test]
    fn test_storage_open() {
        let (config, _temp) = test_config();
        let storage = Storage::open(&config).unwrap();
        assert!(storage.db.cf_handle(CF_LOANS).is_some());
        assert!(storage.db.cf_handle(CF_META).is_some());
        assert!(storage.is_fresh().unwrap());
    }

    #[test]
    fn test_genesis_round_trip() {
        let (config, _temp) = test_config();
        let storage = Storage::open(&config).unwrap();

        storage.write_genesis(&genesis_vault()).unwrap();
        assert!(!storage.is_fresh().unwrap());
        assert_eq!(storage.genesis_supply().unwrap(), 1_000);

        let book = storage.load_book().unwrap();
        assert!(book.is_empty());
        assert_eq!(book.vault().balance_of(&AccountId::new("alice")), 500);
    }

    #[test]
    fn test_commit_and_reload() {
        let (config, _temp) = test_config();
        let storage = Storage::open(&config).unwrap();
        storage.write_genesis(&genesis_vault()).unwrap();

        let mut book = storage.load_book().unwrap();
        let alice = AccountId::new("alice");
        let bob = AccountId::new("bob");

        let request = book.plan_request(&alice, 10, 60, 200, T0).unwrap();
        storage.commit(&request).unwrap();
        book.apply(&request);

        let fund = book.plan_fund(&bob, 0, 200, T0 + 5).unwrap();
        storage.commit(&fund).unwrap();
        book.apply(&fund);

        let reloaded = storage.load_book().unwrap();
        assert_eq!(reloaded.loans(), book.loans());
        assert_eq!(reloaded.vault().escrow(), 200);
        assert_eq!(reloaded.vault().balance_of(&bob), 300);
        assert_eq!(reloaded.next_sequence(), 2);

        assert_eq!(reloaded.loan(0).unwrap().lender, Some(bob));
    }

    #[test]
    fn test_get_loan_events() {
        let (config, _temp) = test_config();
        let storage = Storage::open(&config).unwrap();
        storage.write_genesis(&genesis_vault()).unwrap();

        let mut book = storage.load_book().unwrap();
        let alice = AccountId::new("alice");
        let bob = AccountId::new("bob");

        // Interleave two loans so the index has to separate them
        let first = book.plan_request(&alice, 1, 60, 10, T0).unwrap();
        storage.commit(&first).unwrap();
        book.apply(&first);
        let second = book.plan_request(&bob, 1, 60, 10, T0).unwrap();
        storage.commit(&second).unwrap();
        book.apply(&second);
        let fund = book.plan_fund(&bob, 0, 10, T0 + 1).unwrap();
        storage.commit(&fund).unwrap();
        book.apply(&fund);

        let events = storage.get_loan_events(0).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event.name(), "LoanRequested");
        assert_eq!(events[1].event.name(), "LoanFunded");
        assert!(events.iter().all(|e| e.loan_id == 0));

        assert_eq!(storage.get_loan_events(1).unwrap().len(), 1);
        assert!(storage.get_loan_events(2).unwrap().is_empty());
    }

    #[test]
    fn test_reopen_keeps_genesis() {
        let (config, _temp) = test_config();
        let storage = Storage::open(&config).unwrap();
        storage.write_genesis(&genesis_vault()).unwrap();
        storage.close().unwrap();

        let storage = Storage::open(&config).unwrap();
        assert!(!storage.is_fresh().unwrap());
        assert_eq!(storage.genesis_supply().unwrap(), 1_000);
        assert!(storage.load_book().unwrap().loan(0).is_err());
    }
}
