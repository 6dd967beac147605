//! Main ledger orchestration layer
//!
//! This module ties together storage, partitions, accounts, the transaction
//! engine and the audit verifier into the tenant-scoped API.
//!
//! # Example
//!
//! ```no_run
//! use rust_decimal::Decimal;
//! use wallet_ledger::{Config, Ledger, PostRequest, TenantId, TransactionKind};
//!
//! #[tokio::main]
//! async fn main() -> wallet_ledger::Result<()> {
//!     let ledger = Ledger::open(Config::default()).await?;
//!     let tenant_id = TenantId::from_uuid(uuid::Uuid::now_v7());
//!     ledger.ensure_wallet(tenant_id).await?;
//!
//!     let request = PostRequest::new(
//!         tenant_id,
//!         "credits",
//!         Decimal::from(100),
//!         "purchase-8812",
//!         TransactionKind::Credit,
//!     );
//!     let result = ledger.post(request).await?;
//!     println!("balance: {}", result.balance_after);
//!
//!     ledger.shutdown().await
//! }
//! ```

use crate::{
    accounts::AccountStore,
    audit::{AuditVerifier, ConservationReport, VerificationReport},
    crypto::KeyPair,
    engine::TransactionEngine,
    guard::{ConsistencyGuard, RetryPolicy},
    maintenance::{spawn_partition_maintenance, MaintenanceHandle},
    metrics::Metrics,
    partition::{PartitionInfo, PartitionManager},
    storage::{Storage, StorageStats, CURSOR_LEN},
    types::{
        Account, AccountId, AccountType, AllocationRequest, AllocationResult, BalanceView,
        Currency, Metadata, PostRequest, TenantId, TransactionId, TransactionPage,
        TransactionRecord, TransactionResult, Wallet, WalletStatus,
    },
    Config, Error, Result,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Duration;

/// Main ledger interface
#[derive(Debug)]
pub struct Ledger {
    /// Direct storage access (for reads)
    storage: Arc<Storage>,

    /// Wallets and accounts
    accounts: Arc<AccountStore>,

    /// Partition registry
    partitions: Arc<PartitionManager>,

    /// Write path
    engine: TransactionEngine,

    /// Read-only integrity checks
    verifier: AuditVerifier,

    /// Background provisioning (if enabled)
    maintenance: Option<(MaintenanceHandle, JoinHandle<()>)>,

    /// Prometheus metrics
    metrics: Arc<Metrics>,

    /// Configuration
    config: Config,
}

impl Ledger {
    /// Open ledger with configuration
    ///
    /// Provisions partitions once before returning and, when enabled,
    /// spawns the maintenance task (requires a Tokio runtime).
    pub async fn open(config: Config) -> Result<Self> {
        config.validate()?;

        // Open storage
        let storage = Arc::new(Storage::open(&config)?);

        let metrics = Arc::new(
            Metrics::new().map_err(|e| Error::Config(format!("Failed to register metrics: {}", e)))?,
        );

        let partitions = Arc::new(PartitionManager::load(
            storage.clone(),
            config.partitions.granularity,
            metrics.clone(),
        )?);
        partitions.ensure_provisioned(config.partitions.horizon, Utc::now())?;

        let accounts = Arc::new(AccountStore::new(storage.clone(), config.accounts.clone()));
        let guard = ConsistencyGuard::new(RetryPolicy::from(&config.retry), metrics.clone());
        let mut engine = TransactionEngine::new(
            storage.clone(),
            accounts.clone(),
            partitions.clone(),
            guard,
            metrics.clone(),
        );
        let mut verifier = AuditVerifier::new(storage.clone(), None);

        if let Some(seed_hex) = &config.signing.seed_hex {
            let keypair = KeyPair::from_seed_hex(seed_hex)?;
            verifier.set_public_key(keypair.public_key());
            engine.set_keypair(Arc::new(keypair));
        }

        // Spawn maintenance
        let maintenance = config.partitions.maintenance_enabled.then(|| {
            spawn_partition_maintenance(
                partitions.clone(),
                config.partitions.horizon,
                Duration::from_secs(config.partitions.maintenance_interval_secs),
            )
        });

        tracing::info!(
            service = %config.service_name,
            version = %config.service_version,
            data_dir = ?config.data_dir,
            partitions = partitions.partitions().len(),
            maintenance = maintenance.is_some(),
            signing = config.signing.seed_hex.is_some(),
            "Ledger opened"
        );

        Ok(Self {
            storage,
            accounts,
            partitions,
            engine,
            verifier,
            maintenance,
            metrics,
            config,
        })
    }

    /// Set signing key pair
    ///
    /// New records are signed and chain verification checks signatures.
    pub fn with_keypair(mut self, keypair: KeyPair) -> Self {
        self.verifier.set_public_key(keypair.public_key());
        self.engine.set_keypair(Arc::new(keypair));
        self
    }

    // Wallets

    /// Create the tenant's wallet
    pub async fn create_wallet(
        &self,
        tenant_id: TenantId,
        currency: Option<Currency>,
        metadata: Metadata,
    ) -> Result<Wallet> {
        self.accounts.create_wallet(tenant_id, currency, metadata)
    }

    /// Get the tenant's wallet, creating it with defaults if missing
    pub async fn ensure_wallet(&self, tenant_id: TenantId) -> Result<Wallet> {
        self.accounts.ensure_wallet(tenant_id)
    }

    /// Get the tenant's wallet
    pub async fn get_wallet(&self, tenant_id: TenantId) -> Result<Wallet> {
        self.accounts.get_wallet_by_tenant(tenant_id)
    }

    /// Suspend, reactivate or close the tenant's wallet
    pub async fn set_wallet_status(&self, tenant_id: TenantId, status: WalletStatus) -> Result<Wallet> {
        self.accounts.set_wallet_status(tenant_id, status)
    }

    // Transactions

    /// Apply a balance change exactly once per idempotency key
    pub async fn post(&self, request: PostRequest) -> Result<TransactionResult> {
        self.engine.post(request).await
    }

    /// Reverse an earlier transaction in full
    pub async fn reverse(
        &self,
        tenant_id: TenantId,
        transaction_id: TransactionId,
        reason: Option<String>,
    ) -> Result<TransactionResult> {
        self.engine.reverse(tenant_id, transaction_id, reason).await
    }

    /// Move balance between two tenants as a debit and a credit
    pub async fn allocate(&self, request: AllocationRequest) -> Result<AllocationResult> {
        self.engine.allocate(request).await
    }

    /// Get a transaction owned by the tenant
    pub async fn get_transaction(
        &self,
        tenant_id: TenantId,
        transaction_id: TransactionId,
    ) -> Result<TransactionRecord> {
        let record = self
            .storage
            .get_transaction(transaction_id)?
            .ok_or_else(|| Error::TransactionNotFound(transaction_id.to_string()))?;

        if record.tenant_id != tenant_id {
            return Err(Error::TenantMismatch(format!(
                "transaction {} does not belong to tenant {}",
                transaction_id, tenant_id
            )));
        }
        Ok(record)
    }

    // Reads

    /// Current balance and version; an account not created yet reads as zero
    pub async fn get_balance(&self, tenant_id: TenantId, account_type: &str) -> Result<BalanceView> {
        Ok(match self.tenant_account(tenant_id, account_type)? {
            Some(account) => BalanceView {
                balance: account.balance,
                version: account.version,
            },
            None => BalanceView {
                balance: Decimal::ZERO,
                version: 0,
            },
        })
    }

    /// One page of an account's transactions in `[from, to)`, ascending
    pub async fn list_transactions(
        &self,
        tenant_id: TenantId,
        account_type: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        page_token: Option<&str>,
    ) -> Result<TransactionPage> {
        let cursor = page_token.map(decode_page_token).transpose()?;

        let account = match self.tenant_account(tenant_id, account_type)? {
            Some(account) if from < to => account,
            _ => {
                return Ok(TransactionPage {
                    transactions: Vec::new(),
                    next_page_token: None,
                })
            }
        };

        let page_size = self.config.query.page_size;
        let mut entries = self
            .storage
            .scan_history(account.id, from, to, cursor.as_deref(), page_size + 1)?;

        let next_page_token = if entries.len() > page_size {
            entries.truncate(page_size);
            entries.last().map(|entry| hex::encode(&entry.cursor))
        } else {
            None
        };

        let transactions = entries
            .into_iter()
            .map(|entry| {
                entry
                    .record
                    .ok_or_else(|| Error::TransactionNotFound(entry.transaction_id.to_string()))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(TransactionPage {
            transactions,
            next_page_token,
        })
    }

    fn tenant_account(&self, tenant_id: TenantId, account_type: &str) -> Result<Option<Account>> {
        let account_type = AccountType::parse(account_type)?;
        let wallet = self.accounts.get_wallet_by_tenant(tenant_id)?;

        let account = self.accounts.find_account(wallet.id, &account_type)?;
        if let Some(account) = &account {
            if account.tenant_id != tenant_id {
                return Err(Error::TenantMismatch(format!(
                    "account {} does not belong to tenant {}",
                    account.id, tenant_id
                )));
            }
        }
        Ok(account)
    }

    // Audit

    /// Verify an account's hash chain over `[from, to)`
    pub async fn verify_chain(
        &self,
        account_id: AccountId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<VerificationReport> {
        self.verifier.verify_chain(account_id, from, to)
    }

    /// Check an account's balance against the sum of its history
    pub async fn verify_conservation(&self, account_id: AccountId) -> Result<ConservationReport> {
        self.verifier.verify_conservation(account_id)
    }

    // Partitions

    /// Provision partitions through the configured horizon now
    pub async fn ensure_partitions(&self) -> Result<Vec<String>> {
        match &self.maintenance {
            Some((handle, _)) => handle.run_now().await,
            None => self
                .partitions
                .ensure_provisioned(self.config.partitions.horizon, Utc::now()),
        }
    }

    /// Provisioned partitions
    pub fn partitions(&self) -> Vec<PartitionInfo> {
        self.partitions.partitions()
    }

    /// Metrics registry owner
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Approximate wallet, account and partition counts
    pub fn stats(&self) -> Result<StorageStats> {
        self.storage.get_stats()
    }

    /// Active configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Shutdown ledger
    pub async fn shutdown(self) -> Result<()> {
        if let Some((handle, join)) = self.maintenance {
            handle.shutdown().await?;
            join.await
                .map_err(|e| Error::Concurrency(format!("Maintenance task failed: {}", e)))?;
        }
        tracing::info!(service = %self.config.service_name, "Ledger shut down");
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn storage(&self) -> &Storage {
        &self.storage
    }
}

fn decode_page_token(token: &str) -> Result<Vec<u8>> {
    let cursor = hex::decode(token).map_err(|_| Error::InvalidRequest("Malformed page token".to_string()))?;
    if cursor.len() != CURSOR_LEN {
        return Err(Error::InvalidRequest("Malformed page token".to_string()));
    }
    Ok(cursor)
}
