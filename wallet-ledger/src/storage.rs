//! Storage layer using RocksDB
//!
//! # Column Families
//!
//! - `wallets` - Wallet records (key: wallet_id)
//! - `accounts` - Account records with balance and version (key: account_id)
//! - `indices` - Secondary indices (tenant, wallet+type, idempotency key,
//!   transaction id, account history)
//! - `partitions` - Partition metadata (key: partition name)
//! - `tx_default` - Catch-all transaction partition
//! - `tx_<period>` - One column family per provisioned time partition,
//!   created at runtime
//!
//! Transaction records are keyed by `time_key(created_at) || id` inside their
//! partition, mirroring the `(id, created_at)` composite key.
//!
//! # Atomicity
//!
//! [`Storage::commit`] is the only path that writes a balance. It holds the
//! account's lock while it compares the stored version, checks the
//! idempotency index and writes the account, the record and every index in
//! one `WriteBatch`.

use crate::{
    error::{Error, Result},
    partition::PartitionInfo,
    types::{Account, AccountId, AccountType, TenantId, TransactionId, TransactionRecord, Wallet, WalletId},
    Config,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBCompactionStyle, Direction, IteratorMode, Options,
    WriteBatch, WriteOptions, DB,
};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash as _, Hasher};
use std::sync::Arc;

/// Column family names
const CF_WALLETS: &str = "wallets";
const CF_ACCOUNTS: &str = "accounts";
const CF_INDICES: &str = "indices";
const CF_PARTITIONS: &str = "partitions";

/// Catch-all partition for timestamps outside provisioned ranges
pub const DEFAULT_PARTITION: &str = "tx_default";

/// Prefix shared by every transaction partition column family
pub const PARTITION_PREFIX: &str = "tx_";

/// Index key prefixes (first byte of every key in `indices`)
const IDX_TENANT_WALLET: u8 = b'w';
const IDX_WALLET_ACCOUNT: u8 = b'a';
const IDX_IDEMPOTENCY: u8 = b'i';
const IDX_TRANSACTION: u8 = b't';
const IDX_ACCOUNT_HISTORY: u8 = b'h';

/// Lock stripes for idempotency-key uniqueness
const KEY_STRIPES: usize = 64;

/// Length of a history cursor: time key (8) + transaction id (16)
pub const CURSOR_LEN: usize = 24;

/// Where a transaction record lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Locator {
    /// Partition column family
    pub partition: String,
    /// Key inside the partition
    pub key: Vec<u8>,
}

/// One entry of an account's history index
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    /// `time_key || transaction_id`, usable as a page cursor
    pub cursor: Vec<u8>,
    /// Transaction id from the index key
    pub transaction_id: TransactionId,
    /// Record location
    pub locator: Locator,
    /// Record, `None` if the partition no longer holds it
    pub record: Option<TransactionRecord>,
}

/// Outcome of a compare-and-swap commit
#[derive(Debug)]
pub enum CommitOutcome {
    /// Balance and record written
    Applied,
    /// The idempotency key was already committed; nothing written
    Duplicate(TransactionRecord),
}

/// Storage wrapper for RocksDB
pub struct Storage {
    db: Arc<DB>,

    /// Fsync the WAL on each commit
    sync_writes: bool,

    /// Per-account compare-and-swap sections. One entry per account ever
    /// written, bounded by the account count since accounts are never deleted
    account_locks: DashMap<AccountId, Arc<Mutex<()>>>,

    /// Idempotency key stripes, always taken after an account lock
    key_stripes: Vec<Mutex<()>>,

    /// Serializes wallet/account creation and partition creation
    catalog_lock: Mutex<()>,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("path", &self.db.path())
            .field("sync_writes", &self.sync_writes)
            .finish()
    }
}

impl Storage {
    /// Open or create database
    pub fn open(config: &Config) -> Result<Self> {
        let path = &config.data_dir;

        // Create directory if not exists
        std::fs::create_dir_all(path)?;

        // Database options
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

        // Fixed column families plus any partitions created by earlier runs
        let mut names: Vec<String> = [CF_WALLETS, CF_ACCOUNTS, CF_INDICES, CF_PARTITIONS, DEFAULT_PARTITION]
            .iter()
            .map(|name| name.to_string())
            .collect();
        // list_cf fails on a fresh directory, which simply means no partitions yet
        for name in DB::list_cf(&db_opts, path).unwrap_or_default() {
            if name.starts_with(PARTITION_PREFIX) && !names.contains(&name) {
                names.push(name);
            }
        }

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = names
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Self::cf_options(name)))
            .collect();

        // Open database
        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        tracing::info!(
            path = ?path,
            column_families = names.len(),
            "Opened RocksDB"
        );

        Ok(Self {
            db: Arc::new(db),
            sync_writes: config.rocksdb.sync_writes,
            account_locks: DashMap::new(),
            key_stripes: (0..KEY_STRIPES).map(|_| Mutex::new(())).collect(),
            catalog_lock: Mutex::new(()),
        })
    }

    // Column family options

    fn cf_options(name: &str) -> Options {
        let mut opts = Options::default();
        if name.starts_with(PARTITION_PREFIX) {
            // Cold, append-only history compresses well
            opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
            opts.set_bottommost_compression_type(rocksdb::DBCompressionType::Zstd);
        } else if name == CF_INDICES {
            opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
            let mut block_opts = rocksdb::BlockBasedOptions::default();
            block_opts.set_bloom_filter(10.0, false); // 10 bits per key
            opts.set_block_based_table_factory(&block_opts);
        } else {
            // Wallets and accounts are hot, use LZ4 for speed
            opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        }
        opts
    }

    // Helper: get column family handle

    fn cf(&self, name: &str) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", name)))
    }

    fn write_options(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.sync_writes);
        opts
    }

    fn get_value<T: for<'de> Deserialize<'de>>(&self, cf_name: &str, key: &[u8]) -> Result<Option<T>> {
        let cf = self.cf(cf_name)?;
        match self.db.get_cf(&cf, key)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    // Partition operations

    /// Whether a partition column family exists
    pub fn has_partition(&self, name: &str) -> bool {
        self.db.cf_handle(name).is_some()
    }

    /// Create a partition column family and record its metadata.
    ///
    /// Returns `false` when the partition already existed.
    pub fn create_partition(&self, info: &PartitionInfo) -> Result<bool> {
        let _catalog = self.catalog_lock.lock();

        let meta_exists = self.get_value::<PartitionInfo>(CF_PARTITIONS, info.name.as_bytes())?.is_some();
        if meta_exists && self.has_partition(&info.name) {
            return Ok(false);
        }

        if !self.has_partition(&info.name) {
            self.db.create_cf(&info.name, &Self::cf_options(&info.name))?;
        }

        let cf = self.cf(CF_PARTITIONS)?;
        self.db
            .put_cf_opt(&cf, info.name.as_bytes(), bincode::serialize(info)?, &self.write_options())?;

        Ok(true)
    }

    /// All recorded partitions, ordered by name
    pub fn list_partitions(&self) -> Result<Vec<PartitionInfo>> {
        let cf = self.cf(CF_PARTITIONS)?;
        let mut partitions = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (_, value) = item?;
            partitions.push(bincode::deserialize(&value)?);
        }
        Ok(partitions)
    }

    // Wallet operations

    /// Get wallet by ID
    pub fn get_wallet(&self, wallet_id: WalletId) -> Result<Option<Wallet>> {
        self.get_value(CF_WALLETS, wallet_id.as_bytes())
    }

    /// Get the wallet owned by a tenant
    pub fn get_wallet_by_tenant(&self, tenant_id: TenantId) -> Result<Option<Wallet>> {
        let key = index_key(IDX_TENANT_WALLET, tenant_id.as_bytes());
        match self.get_value::<WalletId>(CF_INDICES, &key)? {
            Some(wallet_id) => self.get_wallet(wallet_id),
            None => Ok(None),
        }
    }

    /// Insert a wallet with its initial accounts (atomic).
    ///
    /// Fails with `WalletAlreadyExists` if the tenant already owns a wallet.
    pub fn insert_wallet(&self, wallet: &Wallet, accounts: &[Account]) -> Result<()> {
        let _catalog = self.catalog_lock.lock();

        let tenant_key = index_key(IDX_TENANT_WALLET, wallet.tenant_id.as_bytes());
        let cf_indices = self.cf(CF_INDICES)?;
        if self.db.get_cf(&cf_indices, &tenant_key)?.is_some() {
            return Err(Error::WalletAlreadyExists(wallet.tenant_id.to_string()));
        }

        let mut batch = WriteBatch::default();

        let cf_wallets = self.cf(CF_WALLETS)?;
        batch.put_cf(&cf_wallets, wallet.id.as_bytes(), bincode::serialize(wallet)?);
        batch.put_cf(&cf_indices, &tenant_key, bincode::serialize(&wallet.id)?);

        let cf_accounts = self.cf(CF_ACCOUNTS)?;
        for account in accounts {
            batch.put_cf(&cf_accounts, account.id.as_bytes(), bincode::serialize(account)?);
            batch.put_cf(
                &cf_indices,
                wallet_account_key(account.wallet_id, &account.account_type),
                bincode::serialize(&account.id)?,
            );
        }

        self.db.write_opt(batch, &self.write_options())?;
        Ok(())
    }

    /// Read-modify-write a wallet under the catalog lock
    pub fn update_wallet<F>(&self, wallet_id: WalletId, update: F) -> Result<Wallet>
    where
        F: FnOnce(&mut Wallet) -> Result<()>,
    {
        let _catalog = self.catalog_lock.lock();

        let mut wallet = self
            .get_wallet(wallet_id)?
            .ok_or_else(|| Error::WalletNotFound(wallet_id.to_string()))?;
        update(&mut wallet)?;

        let cf = self.cf(CF_WALLETS)?;
        self.db
            .put_cf_opt(&cf, wallet.id.as_bytes(), bincode::serialize(&wallet)?, &self.write_options())?;
        Ok(wallet)
    }

    // Account operations

    /// Get account by ID
    pub fn get_account(&self, account_id: AccountId) -> Result<Option<Account>> {
        self.get_value(CF_ACCOUNTS, account_id.as_bytes())
    }

    /// Get the account of a given type in a wallet
    pub fn find_account(&self, wallet_id: WalletId, account_type: &AccountType) -> Result<Option<Account>> {
        match self.get_value::<AccountId>(CF_INDICES, &wallet_account_key(wallet_id, account_type))? {
            Some(account_id) => self.get_account(account_id),
            None => Ok(None),
        }
    }

    /// Insert an account unless `(wallet_id, type)` already exists.
    ///
    /// Returns whichever account owns the pair afterwards.
    pub fn insert_account_if_absent(&self, account: Account) -> Result<Account> {
        let _catalog = self.catalog_lock.lock();

        if let Some(existing) = self.find_account(account.wallet_id, &account.account_type)? {
            return Ok(existing);
        }

        let mut batch = WriteBatch::default();
        let cf_accounts = self.cf(CF_ACCOUNTS)?;
        let cf_indices = self.cf(CF_INDICES)?;
        batch.put_cf(&cf_accounts, account.id.as_bytes(), bincode::serialize(&account)?);
        batch.put_cf(
            &cf_indices,
            wallet_account_key(account.wallet_id, &account.account_type),
            bincode::serialize(&account.id)?,
        );
        self.db.write_opt(batch, &self.write_options())?;

        tracing::debug!(
            account_id = %account.id,
            wallet_id = %account.wallet_id,
            account_type = %account.account_type,
            "Account created"
        );

        Ok(account)
    }

    fn account_lock(&self, account_id: AccountId) -> Arc<Mutex<()>> {
        self.account_locks
            .entry(account_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn key_stripe(&self, idempotency_key: &str) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        idempotency_key.hash(&mut hasher);
        &self.key_stripes[(hasher.finish() as usize) % KEY_STRIPES]
    }

    // Transaction operations

    /// Compare-and-swap the account and append its transaction record.
    ///
    /// `account` is the post-mutation state; it is written only if the stored
    /// version still equals `expected_version`, the wallet is active, and the
    /// record's idempotency key has never been committed.
    pub fn commit(
        &self,
        expected_version: u64,
        account: &Account,
        record: &TransactionRecord,
        partition: &str,
    ) -> Result<CommitOutcome> {
        let lock = self.account_lock(account.id);
        let _account_guard = lock.lock();

        let current = self
            .get_account(account.id)?
            .ok_or_else(|| Error::AccountNotFound(account.id.to_string()))?;
        if current.version != expected_version {
            return Err(Error::VersionConflict {
                account_id: account.id,
                expected: expected_version,
                actual: current.version,
            });
        }

        let wallet = self
            .get_wallet(current.wallet_id)?
            .ok_or_else(|| Error::WalletNotFound(current.tenant_id.to_string()))?;
        wallet.ensure_active()?;

        let _key_guard = self.key_stripe(&record.idempotency_key).lock();
        if let Some(existing) = self.find_by_idempotency_key(&record.idempotency_key)? {
            return Ok(CommitOutcome::Duplicate(existing));
        }

        let locator = Locator {
            partition: partition.to_string(),
            key: record_key(record.created_at, record.id),
        };
        let locator_bytes = bincode::serialize(&locator)?;

        let mut batch = WriteBatch::default();

        // 1. Account balance + version
        let cf_accounts = self.cf(CF_ACCOUNTS)?;
        batch.put_cf(&cf_accounts, account.id.as_bytes(), bincode::serialize(account)?);

        // 2. Transaction record in its partition
        let cf_partition = self.cf(partition)?;
        batch.put_cf(&cf_partition, &locator.key, bincode::serialize(record)?);

        // 3. Indices
        let cf_indices = self.cf(CF_INDICES)?;
        batch.put_cf(
            &cf_indices,
            index_key(IDX_IDEMPOTENCY, record.idempotency_key.as_bytes()),
            &locator_bytes,
        );
        batch.put_cf(&cf_indices, index_key(IDX_TRANSACTION, record.id.as_bytes()), &locator_bytes);
        batch.put_cf(
            &cf_indices,
            history_key(record.account_id, record.created_at, record.id),
            &locator_bytes,
        );

        // Atomic commit
        self.db.write_opt(batch, &self.write_options())?;

        tracing::debug!(
            transaction_id = %record.id,
            account_id = %record.account_id,
            version = account.version,
            partition,
            "Transaction committed"
        );

        Ok(CommitOutcome::Applied)
    }

    /// Read a record from its partition
    pub fn read_record(&self, locator: &Locator) -> Result<Option<TransactionRecord>> {
        self.get_value(&locator.partition, &locator.key)
    }

    fn record_at_index(&self, key: &[u8]) -> Result<Option<TransactionRecord>> {
        match self.get_value::<Locator>(CF_INDICES, key)? {
            Some(locator) => self.read_record(&locator),
            None => Ok(None),
        }
    }

    /// Look up a transaction by idempotency key
    pub fn find_by_idempotency_key(&self, idempotency_key: &str) -> Result<Option<TransactionRecord>> {
        self.record_at_index(&index_key(IDX_IDEMPOTENCY, idempotency_key.as_bytes()))
    }

    /// Look up a transaction by ID
    pub fn get_transaction(&self, transaction_id: TransactionId) -> Result<Option<TransactionRecord>> {
        self.record_at_index(&index_key(IDX_TRANSACTION, transaction_id.as_bytes()))
    }

    /// Scan an account's history in `[from, to)`, ascending.
    ///
    /// With `after`, scanning resumes strictly after that cursor. At most
    /// `limit` entries are returned.
    pub fn scan_history(
        &self,
        account_id: AccountId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        after: Option<&[u8]>,
        limit: usize,
    ) -> Result<Vec<HistoryEntry>> {
        let prefix = history_prefix(account_id);
        let end = [prefix.as_slice(), &time_key(to)].concat();
        let lower = [prefix.as_slice(), &time_key(from)].concat();
        // A cursor never moves the scan before `from`
        let (start, resuming) = match after {
            Some(cursor) => {
                let resume = [prefix.as_slice(), cursor].concat();
                if resume > lower {
                    (resume, true)
                } else {
                    (lower, false)
                }
            }
            None => (lower, false),
        };

        let cf = self.cf(CF_INDICES)?;
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&start, Direction::Forward));

        let mut entries = Vec::new();
        for item in iter {
            if entries.len() >= limit {
                break;
            }
            let (key, value) = item?;
            if !key.starts_with(&prefix) || key.as_ref() >= end.as_slice() {
                break;
            }
            if resuming && key.as_ref() == start.as_slice() {
                continue;
            }
            entries.push(self.history_entry(&prefix, &key, &value)?);
        }

        Ok(entries)
    }

    /// The last history entry strictly before `before`
    pub fn last_history_before(
        &self,
        account_id: AccountId,
        before: DateTime<Utc>,
    ) -> Result<Option<HistoryEntry>> {
        let prefix = history_prefix(account_id);
        let start = [prefix.as_slice(), &time_key(before)].concat();

        let cf = self.cf(CF_INDICES)?;
        let mut iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&start, Direction::Reverse));

        match iter.next() {
            Some(item) => {
                let (key, value) = item?;
                // Index keys are longer than `start`, so a match is strictly earlier
                if !key.starts_with(&prefix) || key.as_ref() >= start.as_slice() {
                    return Ok(None);
                }
                Ok(Some(self.history_entry(&prefix, &key, &value)?))
            }
            None => Ok(None),
        }
    }

    fn history_entry(&self, prefix: &[u8], key: &[u8], value: &[u8]) -> Result<HistoryEntry> {
        let cursor = key[prefix.len()..].to_vec();
        if cursor.len() != CURSOR_LEN {
            return Err(Error::Storage(format!(
                "Malformed history key of {} bytes",
                key.len()
            )));
        }
        let mut id_bytes = [0u8; 16];
        id_bytes.copy_from_slice(&cursor[8..]);
        let locator: Locator = bincode::deserialize(value)?;
        let record = self.read_record(&locator)?;

        Ok(HistoryEntry {
            cursor,
            transaction_id: TransactionId::from_uuid(uuid::Uuid::from_bytes(id_bytes)),
            locator,
            record,
        })
    }

    // Statistics

    /// Get storage statistics
    pub fn get_stats(&self) -> Result<StorageStats> {
        let wallets = self.approximate_count(CF_WALLETS)?;
        let accounts = self.approximate_count(CF_ACCOUNTS)?;
        let partitions = self.list_partitions()?.len() as u64;

        Ok(StorageStats {
            total_wallets: wallets,
            total_accounts: accounts,
            total_partitions: partitions,
        })
    }

    fn approximate_count(&self, cf_name: &str) -> Result<u64> {
        let cf = self.cf(cf_name)?;
        // RocksDB property for approximate count
        let prop = self
            .db
            .property_int_value_cf(&cf, "rocksdb.estimate-num-keys")?
            .unwrap_or(0);

        Ok(prop)
    }

    // Raw access that bypasses the write path, for integrity tests

    #[cfg(test)]
    pub(crate) fn overwrite_record(&self, record: &TransactionRecord) -> Result<()> {
        let locator: Locator = self
            .get_value(CF_INDICES, &index_key(IDX_TRANSACTION, record.id.as_bytes()))?
            .ok_or_else(|| Error::TransactionNotFound(record.id.to_string()))?;
        let cf = self.cf(&locator.partition)?;
        self.db.put_cf(&cf, &locator.key, bincode::serialize(record)?)?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn delete_record(&self, record: &TransactionRecord, keep_index: bool) -> Result<()> {
        let locator: Locator = self
            .get_value(CF_INDICES, &index_key(IDX_TRANSACTION, record.id.as_bytes()))?
            .ok_or_else(|| Error::TransactionNotFound(record.id.to_string()))?;
        let cf = self.cf(&locator.partition)?;
        self.db.delete_cf(&cf, &locator.key)?;
        if !keep_index {
            let cf_indices = self.cf(CF_INDICES)?;
            self.db
                .delete_cf(&cf_indices, history_key(record.account_id, record.created_at, record.id))?;
        }
        Ok(())
    }
}

/// Storage statistics
#[derive(Debug, Clone)]
pub struct StorageStats {
    /// Approximate wallet count
    pub total_wallets: u64,
    /// Approximate account count
    pub total_accounts: u64,
    /// Provisioned partitions (excluding the catch-all)
    pub total_partitions: u64,
}

// Key helpers

/// Order-preserving encoding of a timestamp (sign bit flipped, big-endian)
pub fn time_key(ts: DateTime<Utc>) -> [u8; 8] {
    // Clamp outside the representable nanosecond range (~1677..2262)
    let nanos = ts
        .timestamp_nanos_opt()
        .unwrap_or(if ts.timestamp() < 0 { i64::MIN } else { i64::MAX });
    ((nanos as u64) ^ (1u64 << 63)).to_be_bytes()
}

fn index_key(prefix: u8, id: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + id.len());
    key.push(prefix);
    key.extend_from_slice(id);
    key
}

fn wallet_account_key(wallet_id: WalletId, account_type: &AccountType) -> Vec<u8> {
    let mut key = index_key(IDX_WALLET_ACCOUNT, wallet_id.as_bytes());
    key.extend_from_slice(account_type.as_str().as_bytes());
    key
}

fn record_key(created_at: DateTime<Utc>, id: TransactionId) -> Vec<u8> {
    let mut key = time_key(created_at).to_vec();
    key.extend_from_slice(id.as_bytes());
    key
}

fn history_prefix(account_id: AccountId) -> Vec<u8> {
    index_key(IDX_ACCOUNT_HISTORY, account_id.as_bytes())
}

fn history_key(account_id: AccountId, created_at: DateTime<Utc>, id: TransactionId) -> Vec<u8> {
    let mut key = history_prefix(account_id);
    key.extend_from_slice(&record_key(created_at, id));
    key
}
