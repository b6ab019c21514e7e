//! Storage layer using RocksDB
//!
//! # Column Families
//!
//! - `webhooks` - Webhook delivery episodes (key: provider_event_id)
//! - `attempts` - Unlock attempts (key: attempt_id)
//! - `entitlements` - Access grants (key: entitlement_id)
//! - `transactions` - Monetary operations (key: transaction_id)
//! - `subscriptions` - Subscription rows (key: user_id)
//! - `job_runs` - Background job runs (key: started_at || run_id)
//! - `leases` - Background job leases (key: job_name)
//! - `indices` - Secondary indices for quota counting, pair uniqueness,
//!   provider-reference uniqueness, and the pending-escrow scan
//!
//! Writes that touch a row plus its indices go through `WriteBatch` so the
//! pair commits atomically. Check-then-write sequences are serialized by the
//! single-writer actor, never here.

use crate::{
    error::{Error, Result},
    types::{
        Entitlement, JobRun, Lease, Subscription, Transaction, TransactionMetadata, UnlockAttempt,
        WebhookEvent,
    },
    Config,
};
use chrono::{DateTime, NaiveDate, Utc};
use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, DBCompactionStyle, Direction, IteratorMode, Options,
    WriteBatch, DB,
};
use std::sync::Arc;
use uuid::Uuid;

/// Column family names
const CF_WEBHOOKS: &str = "webhooks";
const CF_ATTEMPTS: &str = "attempts";
const CF_ENTITLEMENTS: &str = "entitlements";
const CF_TRANSACTIONS: &str = "transactions";
const CF_SUBSCRIPTIONS: &str = "subscriptions";
const CF_JOB_RUNS: &str = "job_runs";
const CF_LEASES: &str = "leases";
const CF_INDICES: &str = "indices";

/// Index key prefixes
const IDX_USER_DAY: &[u8] = b"ud:";
const IDX_PAYMENT_REF: &[u8] = b"pr:";
const IDX_USER_OPPORTUNITY: &[u8] = b"uo:";
const IDX_PROVIDER_REF: &[u8] = b"tx:";
const IDX_PENDING_ESCROW: &[u8] = b"pe:";

/// Storage wrapper for RocksDB
pub struct Storage {
    db: Arc<DB>,
}

impl Storage {
    /// Open or create database
    pub fn open(config: &Config) -> Result<Self> {
        let path = &config.data_dir;

        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        // Tuning from config
        db_opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.rocksdb.max_write_buffer_number);
        db_opts.set_target_file_size_base(config.rocksdb.target_file_size_mb * 1024 * 1024);
        db_opts.set_max_background_jobs(config.rocksdb.max_background_jobs);

        // Universal compaction for write-heavy workload
        db_opts.set_compaction_style(DBCompactionStyle::Universal);

        if config.rocksdb.enable_statistics {
            db_opts.enable_statistics();
        }

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_WEBHOOKS, Self::cf_options_rows()),
            ColumnFamilyDescriptor::new(CF_ATTEMPTS, Self::cf_options_rows()),
            ColumnFamilyDescriptor::new(CF_ENTITLEMENTS, Self::cf_options_rows()),
            ColumnFamilyDescriptor::new(CF_TRANSACTIONS, Self::cf_options_rows()),
            ColumnFamilyDescriptor::new(CF_SUBSCRIPTIONS, Self::cf_options_rows()),
            ColumnFamilyDescriptor::new(CF_JOB_RUNS, Self::cf_options_job_runs()),
            ColumnFamilyDescriptor::new(CF_LEASES, Self::cf_options_rows()),
            ColumnFamilyDescriptor::new(CF_INDICES, Self::cf_options_indices()),
        ];

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        tracing::info!(path = ?path, "Opened RocksDB payment ledger store");

        Ok(Self { db: Arc::new(db) })
    }

    // Column family options

    fn cf_options_rows() -> Options {
        let mut opts = Options::default();
        // Rows are frequently read back, use LZ4 for speed
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts
    }

    fn cf_options_job_runs() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
        opts
    }

    fn cf_options_indices() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        // Indices benefit from bloom filters
        let mut block_opts = rocksdb::BlockBasedOptions::default();
        block_opts.set_bloom_filter(10.0, false); // 10 bits per key
        opts.set_block_based_table_factory(&block_opts);
        opts
    }

    // Helper: get column family handle

    fn cf_handle(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", name)))
    }

    /// Scan all index entries under `prefix`, in key order
    fn scan_index(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let cf = self.cf_handle(CF_INDICES)?;
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix, Direction::Forward));

        let mut entries = Vec::new();
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            entries.push((key.to_vec(), value.to_vec()));
        }

        Ok(entries)
    }

    // Webhook operations

    /// Get webhook event by provider event id
    pub fn get_webhook(&self, provider_event_id: &str) -> Result<Option<WebhookEvent>> {
        let cf = self.cf_handle(CF_WEBHOOKS)?;

        match self.db.get_cf(cf, provider_event_id.as_bytes())? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    /// Put webhook event (insert or update)
    pub fn put_webhook(&self, event: &WebhookEvent) -> Result<()> {
        let cf = self.cf_handle(CF_WEBHOOKS)?;
        let value = bincode::serialize(event)?;

        self.db.put_cf(cf, event.provider_event_id.as_bytes(), &value)?;

        tracing::debug!(
            provider_event_id = %event.provider_event_id,
            status = ?event.status,
            attempt_count = event.attempt_count,
            "Webhook event stored"
        );

        Ok(())
    }

    // Unlock attempt operations

    /// Get unlock attempt by id
    pub fn get_attempt(&self, attempt_id: Uuid) -> Result<UnlockAttempt> {
        let cf = self.cf_handle(CF_ATTEMPTS)?;

        let value = self
            .db
            .get_cf(cf, attempt_id.as_bytes())?
            .ok_or_else(|| Error::AttemptNotFound(attempt_id.to_string()))?;

        Ok(bincode::deserialize(&value)?)
    }

    /// Insert attempt row with its (user, date) index entry (atomic)
    pub fn insert_attempt(&self, attempt: &UnlockAttempt) -> Result<()> {
        let mut batch = WriteBatch::default();

        let cf_attempts = self.cf_handle(CF_ATTEMPTS)?;
        batch.put_cf(
            cf_attempts,
            attempt.attempt_id.as_bytes(),
            bincode::serialize(attempt)?,
        );

        let cf_indices = self.cf_handle(CF_INDICES)?;
        let idx = Self::index_key_user_day(
            attempt.user_id,
            attempt.attempt_date,
            Some(attempt.attempt_id),
        );
        batch.put_cf(cf_indices, &idx, &[]);

        self.db.write(batch)?;
        Ok(())
    }

    /// Update attempt row in place
    pub fn put_attempt(&self, attempt: &UnlockAttempt) -> Result<()> {
        let cf = self.cf_handle(CF_ATTEMPTS)?;
        self.db
            .put_cf(cf, attempt.attempt_id.as_bytes(), bincode::serialize(attempt)?)?;
        Ok(())
    }

    /// Update attempt row and index its payment reference (atomic)
    pub fn attach_attempt_reference(&self, attempt: &UnlockAttempt, reference: &str) -> Result<()> {
        let mut batch = WriteBatch::default();

        let cf_attempts = self.cf_handle(CF_ATTEMPTS)?;
        batch.put_cf(
            cf_attempts,
            attempt.attempt_id.as_bytes(),
            bincode::serialize(attempt)?,
        );

        let cf_indices = self.cf_handle(CF_INDICES)?;
        let idx = Self::index_key_payment_ref(reference);
        batch.put_cf(cf_indices, &idx, attempt.attempt_id.as_bytes());

        self.db.write(batch)?;
        Ok(())
    }

    /// Look up which attempt holds a payment reference
    pub fn attempt_holding_reference(&self, reference: &str) -> Result<Option<Uuid>> {
        let cf = self.cf_handle(CF_INDICES)?;
        let idx = Self::index_key_payment_ref(reference);

        match self.db.get_cf(cf, &idx)? {
            Some(value) => Ok(Some(Self::uuid_from_value(&value)?)),
            None => Ok(None),
        }
    }

    /// Get all attempts for a (user, UTC date) bucket
    pub fn attempts_for_day(&self, user_id: Uuid, date: NaiveDate) -> Result<Vec<UnlockAttempt>> {
        let prefix = Self::index_key_user_day(user_id, date, None);

        let mut attempts = Vec::new();
        for (key, _) in self.scan_index(&prefix)? {
            // Attempt id is the key suffix past the (user, date) prefix
            if key.len() >= prefix.len() + 16 {
                let attempt_id = Self::uuid_from_value(&key[prefix.len()..prefix.len() + 16])?;
                attempts.push(self.get_attempt(attempt_id)?);
            }
        }

        Ok(attempts)
    }

    // Entitlement operations

    /// Get entitlement by id
    pub fn get_entitlement(&self, entitlement_id: Uuid) -> Result<Entitlement> {
        let cf = self.cf_handle(CF_ENTITLEMENTS)?;

        let value = self
            .db
            .get_cf(cf, entitlement_id.as_bytes())?
            .ok_or_else(|| Error::EntitlementNotFound(entitlement_id.to_string()))?;

        Ok(bincode::deserialize(&value)?)
    }

    /// Look up the entitlement id for a (user, opportunity) pair
    pub fn entitlement_id_for(&self, user_id: Uuid, opportunity_id: Uuid) -> Result<Option<Uuid>> {
        let cf = self.cf_handle(CF_INDICES)?;
        let idx = Self::index_key_user_opportunity(user_id, opportunity_id);

        match self.db.get_cf(cf, &idx)? {
            Some(value) => Ok(Some(Self::uuid_from_value(&value)?)),
            None => Ok(None),
        }
    }

    /// Insert entitlement row with its (user, opportunity) index entry (atomic)
    pub fn insert_entitlement(&self, entitlement: &Entitlement) -> Result<()> {
        let mut batch = WriteBatch::default();

        let cf_rows = self.cf_handle(CF_ENTITLEMENTS)?;
        batch.put_cf(
            cf_rows,
            entitlement.entitlement_id.as_bytes(),
            bincode::serialize(entitlement)?,
        );

        let cf_indices = self.cf_handle(CF_INDICES)?;
        let idx =
            Self::index_key_user_opportunity(entitlement.user_id, entitlement.opportunity_id);
        batch.put_cf(cf_indices, &idx, entitlement.entitlement_id.as_bytes());

        self.db.write(batch)?;
        Ok(())
    }

    /// Update entitlement row in place
    pub fn put_entitlement(&self, entitlement: &Entitlement) -> Result<()> {
        let cf = self.cf_handle(CF_ENTITLEMENTS)?;
        self.db.put_cf(
            cf,
            entitlement.entitlement_id.as_bytes(),
            bincode::serialize(entitlement)?,
        )?;
        Ok(())
    }

    // Transaction operations

    /// Get transaction by id
    pub fn get_transaction(&self, transaction_id: Uuid) -> Result<Transaction> {
        let cf = self.cf_handle(CF_TRANSACTIONS)?;

        let value = self
            .db
            .get_cf(cf, transaction_id.as_bytes())?
            .ok_or_else(|| Error::TransactionNotFound(transaction_id.to_string()))?;

        Ok(bincode::deserialize(&value)?)
    }

    /// Look up which transaction holds a provider reference
    pub fn transaction_holding_reference(&self, reference: &str) -> Result<Option<Uuid>> {
        let cf = self.cf_handle(CF_INDICES)?;
        let idx = Self::index_key_provider_ref(reference);

        match self.db.get_cf(cf, &idx)? {
            Some(value) => Ok(Some(Self::uuid_from_value(&value)?)),
            None => Ok(None),
        }
    }

    /// Insert transaction; escrow-held success fees also enter the pending scan index
    pub fn insert_transaction(&self, txn: &Transaction) -> Result<()> {
        let mut batch = WriteBatch::default();

        let cf_rows = self.cf_handle(CF_TRANSACTIONS)?;
        batch.put_cf(cf_rows, txn.transaction_id.as_bytes(), bincode::serialize(txn)?);

        if txn.is_held_escrow() {
            let cf_indices = self.cf_handle(CF_INDICES)?;
            let idx = Self::index_key_pending_escrow(txn);
            batch.put_cf(cf_indices, &idx, &[]);
        }

        self.db.write(batch)?;
        Ok(())
    }

    /// Update transaction row, index newly attached provider references, and
    /// drop it from the pending-escrow index once it leaves the held set (atomic)
    pub fn update_transaction(
        &self,
        txn: &Transaction,
        new_references: &[String],
        was_held_escrow: bool,
    ) -> Result<()> {
        let mut batch = WriteBatch::default();

        let cf_rows = self.cf_handle(CF_TRANSACTIONS)?;
        batch.put_cf(cf_rows, txn.transaction_id.as_bytes(), bincode::serialize(txn)?);

        let cf_indices = self.cf_handle(CF_INDICES)?;
        for reference in new_references {
            let idx = Self::index_key_provider_ref(reference);
            batch.put_cf(cf_indices, &idx, txn.transaction_id.as_bytes());
        }

        if was_held_escrow && !txn.is_held_escrow() {
            let idx = Self::index_key_pending_escrow(txn);
            batch.delete_cf(cf_indices, &idx);
        }

        self.db.write(batch)?;
        Ok(())
    }

    /// Matured pending escrow-held transaction ids at `now`, earliest
    /// release first, bounded by `limit`
    ///
    /// The index is keyed by release time, so unmatured holds never occupy
    /// a batch slot and the bound applies to released work only.
    pub fn matured_escrow_ids(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let now_nanos = now.timestamp_nanos_opt().unwrap_or(i64::MAX);

        let mut ids = Vec::new();
        for (key, _) in self.scan_index(IDX_PENDING_ESCROW)? {
            if ids.len() >= limit {
                break;
            }
            let offset = IDX_PENDING_ESCROW.len() + 8;
            if key.len() < offset + 16 {
                continue;
            }
            let release_nanos = i64::from_be_bytes(
                key[IDX_PENDING_ESCROW.len()..offset]
                    .try_into()
                    .map_err(|_| Error::Storage("Malformed escrow index key".to_string()))?,
            );
            // Keys are ordered by release time; everything past here is unmatured
            if release_nanos > now_nanos {
                break;
            }
            ids.push(Self::uuid_from_value(&key[offset..offset + 16])?);
        }
        Ok(ids)
    }

    // Subscription operations

    /// Get subscription row for a user
    pub fn get_subscription(&self, user_id: Uuid) -> Result<Option<Subscription>> {
        let cf = self.cf_handle(CF_SUBSCRIPTIONS)?;

        match self.db.get_cf(cf, user_id.as_bytes())? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    /// Put subscription row
    pub fn put_subscription(&self, subscription: &Subscription) -> Result<()> {
        let cf = self.cf_handle(CF_SUBSCRIPTIONS)?;
        self.db.put_cf(
            cf,
            subscription.user_id.as_bytes(),
            bincode::serialize(subscription)?,
        )?;
        Ok(())
    }

    // Job run operations

    /// Put job run (keyed by start time for time-ordered scans)
    pub fn put_job_run(&self, run: &JobRun) -> Result<()> {
        let cf = self.cf_handle(CF_JOB_RUNS)?;
        let key = Self::job_run_key(run);
        self.db.put_cf(cf, &key, bincode::serialize(run)?)?;
        Ok(())
    }

    /// Most recent runs of a job, newest first
    pub fn recent_job_runs(&self, job_name: &str, limit: usize) -> Result<Vec<JobRun>> {
        let cf = self.cf_handle(CF_JOB_RUNS)?;
        let iter = self.db.iterator_cf(cf, IteratorMode::End);

        let mut runs = Vec::new();
        for item in iter {
            if runs.len() >= limit {
                break;
            }
            let (_, value) = item?;
            let run: JobRun = bincode::deserialize(&value)?;
            if run.job_name == job_name {
                runs.push(run);
            }
        }

        Ok(runs)
    }

    // Lease operations

    /// Get lease for a job
    pub fn get_lease(&self, job_name: &str) -> Result<Option<Lease>> {
        let cf = self.cf_handle(CF_LEASES)?;

        match self.db.get_cf(cf, job_name.as_bytes())? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    /// Put lease
    pub fn put_lease(&self, lease: &Lease) -> Result<()> {
        let cf = self.cf_handle(CF_LEASES)?;
        self.db
            .put_cf(cf, lease.job_name.as_bytes(), bincode::serialize(lease)?)?;
        Ok(())
    }

    /// Delete lease
    pub fn delete_lease(&self, job_name: &str) -> Result<()> {
        let cf = self.cf_handle(CF_LEASES)?;
        self.db.delete_cf(cf, job_name.as_bytes())?;
        Ok(())
    }

    // Index key helpers

    fn index_key_user_day(user_id: Uuid, date: NaiveDate, attempt_id: Option<Uuid>) -> Vec<u8> {
        let mut key = IDX_USER_DAY.to_vec();
        key.extend_from_slice(user_id.as_bytes());
        key.extend_from_slice(date.format("%Y%m%d").to_string().as_bytes());
        if let Some(id) = attempt_id {
            key.extend_from_slice(id.as_bytes());
        }
        key
    }

    fn index_key_payment_ref(reference: &str) -> Vec<u8> {
        let mut key = IDX_PAYMENT_REF.to_vec();
        key.extend_from_slice(reference.as_bytes());
        key
    }

    fn index_key_user_opportunity(user_id: Uuid, opportunity_id: Uuid) -> Vec<u8> {
        let mut key = IDX_USER_OPPORTUNITY.to_vec();
        key.extend_from_slice(user_id.as_bytes());
        key.extend_from_slice(opportunity_id.as_bytes());
        key
    }

    fn index_key_provider_ref(reference: &str) -> Vec<u8> {
        let mut key = IDX_PROVIDER_REF.to_vec();
        key.extend_from_slice(reference.as_bytes());
        key
    }

    fn index_key_pending_escrow(txn: &Transaction) -> Vec<u8> {
        let release_nanos = match &txn.metadata {
            TransactionMetadata::EscrowShare { release_at, .. } => {
                release_at.timestamp_nanos_opt().unwrap_or(0)
            }
            TransactionMetadata::None => 0,
        };

        let mut key = IDX_PENDING_ESCROW.to_vec();
        key.extend_from_slice(&release_nanos.to_be_bytes());
        key.extend_from_slice(txn.transaction_id.as_bytes());
        key
    }

    fn job_run_key(run: &JobRun) -> Vec<u8> {
        let mut key = run
            .started_at
            .timestamp_nanos_opt()
            .unwrap_or(0)
            .to_be_bytes()
            .to_vec();
        key.extend_from_slice(run.run_id.as_bytes());
        key
    }

    /// Test hook: plant a pending-escrow index entry directly
    #[cfg(test)]
    pub(crate) fn plant_escrow_index_entry(
        &self,
        release_at: DateTime<Utc>,
        transaction_id: Uuid,
    ) -> Result<()> {
        let mut key = IDX_PENDING_ESCROW.to_vec();
        let release_nanos = release_at.timestamp_nanos_opt().unwrap_or(0);
        key.extend_from_slice(&release_nanos.to_be_bytes());
        key.extend_from_slice(transaction_id.as_bytes());

        let cf = self.cf_handle(CF_INDICES)?;
        self.db.put_cf(cf, &key, [0u8; 0])?;
        Ok(())
    }

    fn uuid_from_value(value: &[u8]) -> Result<Uuid> {
        let bytes: [u8; 16] = value
            .try_into()
            .map_err(|_| Error::Storage("Malformed uuid in index".to_string()))?;
        Ok(Uuid::from_bytes(bytes))
    }
}
