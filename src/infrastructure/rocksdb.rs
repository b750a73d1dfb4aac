use crate::domain::event::{DedupRecord, InsertOutcome};
use crate::domain::ports::DedupLedger;
use crate::domain::transaction::TransactionId;
use crate::error::Result;
use async_trait::async_trait;
use rocksdb::{Options, TransactionDB, TransactionDBOptions};
use std::path::Path;
use std::sync::Arc;

/// A durable dedup ledger backed by a RocksDB `TransactionDB`.
///
/// Check-and-insert runs inside a pessimistic transaction: `get_for_update`
/// takes an exclusive lock on the key, so two processes racing on the same
/// `(transaction_id, event_type)` cannot both observe it as absent.
///
/// `Clone` shares the underlying `Arc<TransactionDB>`.
#[derive(Clone)]
pub struct RocksDBDedupLedger {
    db: Arc<TransactionDB>,
}

impl RocksDBDedupLedger {
    /// Opens or creates the ledger at the specified path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);

        let db: TransactionDB = TransactionDB::open(&opts, &TransactionDBOptions::default(), path)?;

        Ok(Self { db: Arc::new(db) })
    }

    pub fn get(&self, transaction_id: &TransactionId, event_type: &str) -> Result<Option<DedupRecord>> {
        match self.db.get(record_key(transaction_id, event_type))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }
}

fn record_key(transaction_id: &TransactionId, event_type: &str) -> Vec<u8> {
    DedupRecord::key_for(transaction_id, event_type).into_bytes()
}

#[async_trait]
impl DedupLedger for RocksDBDedupLedger {
    async fn try_insert(&self, record: DedupRecord) -> Result<InsertOutcome> {
        let key = record.key().into_bytes();
        let value = serde_json::to_vec(&record)?;

        let txn = self.db.transaction();
        if txn.get_for_update(&key, true)?.is_some() {
            // Dropping the transaction rolls it back and releases the lock.
            return Ok(InsertOutcome::AlreadyPresent);
        }
        txn.put(&key, value)?;
        txn.commit()?;
        Ok(InsertOutcome::Inserted)
    }

    async fn contains(&self, transaction_id: &TransactionId, event_type: &str) -> Result<bool> {
        let result = self.db.get(record_key(transaction_id, event_type))?;
        Ok(result.is_some())
    }
}
