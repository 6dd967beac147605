//! Transaction engine
//!
//! Validates balance-changing requests, enforces exactly-once application
//! through the idempotency key, and commits each delta with its hash-chained
//! record via [`AccountStore::apply_delta`] under the [`ConsistencyGuard`].
//!
//! # Flow
//!
//! ```text
//! post(request)
//!   -> validate
//!   -> idempotency fast path (replay)
//!   -> wallet by tenant -> account (lazy)
//!   -> guard.run { re-read account -> apply_delta -> commit }
//!   -> TransactionResult
//! ```

use crate::{
    accounts::{AccountStore, DeltaOutcome, MAX_BALANCE},
    crypto::{KeyPair, HASH_DECIMAL_SCALE},
    guard::ConsistencyGuard,
    metrics::Metrics,
    partition::PartitionManager,
    storage::Storage,
    types::{
        Account, AccountId, AccountType, AllocationRequest, AllocationResult, Metadata,
        PostRequest, Reference, TenantId, TransactionId, TransactionKind, TransactionRecord,
        TransactionResult, GENESIS_HASH,
    },
    Error, Result,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Instant;

/// Longest accepted idempotency key, in bytes
pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 255;

/// Reference type stamped on reversals
pub const REVERSAL_REFERENCE_TYPE: &str = "reversal";

/// Prefix of derived reversal keys, reserved for the ledger
pub const REVERSAL_KEY_PREFIX: &str = "reversal:";

/// Reference type of the debit leg of an allocation
pub const ALLOCATION_OUT_REFERENCE_TYPE: &str = "allocation_out";

/// Reference type of the credit leg of an allocation
pub const ALLOCATION_IN_REFERENCE_TYPE: &str = "allocation_in";

const ALLOCATION_OUT_SUFFIX: &str = ":out";
const ALLOCATION_IN_SUFFIX: &str = ":in";

/// Transaction engine
#[derive(Debug)]
pub struct TransactionEngine {
    storage: Arc<Storage>,
    accounts: Arc<AccountStore>,
    partitions: Arc<PartitionManager>,
    guard: ConsistencyGuard,
    metrics: Arc<Metrics>,
    keypair: Option<Arc<KeyPair>>,
}

impl TransactionEngine {
    /// Create an engine
    pub fn new(
        storage: Arc<Storage>,
        accounts: Arc<AccountStore>,
        partitions: Arc<PartitionManager>,
        guard: ConsistencyGuard,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            storage,
            accounts,
            partitions,
            guard,
            metrics,
            keypair: None,
        }
    }

    /// Sign every new record's hash with `keypair`
    pub fn set_keypair(&mut self, keypair: Arc<KeyPair>) {
        self.keypair = Some(keypair);
    }

    /// Apply a credit, debit or adjustment exactly once per idempotency key
    pub async fn post(&self, request: PostRequest) -> Result<TransactionResult> {
        let account_type = validate(&request)?;

        if let Some(existing) = self.storage.find_by_idempotency_key(&request.idempotency_key)? {
            return self.replay(&request, existing);
        }

        let wallet = self.accounts.get_wallet_by_tenant(request.tenant_id)?;
        let account = self.accounts.get_or_create_account(wallet.id, &account_type)?;
        if account.tenant_id != request.tenant_id {
            return Err(Error::TenantMismatch(format!(
                "account {} does not belong to tenant {}",
                account.id, request.tenant_id
            )));
        }

        self.execute(&request, account.id).await
    }

    /// Post the full-amount reversal of an earlier transaction.
    ///
    /// Repeated calls return the same reversal.
    pub async fn reverse(
        &self,
        tenant_id: TenantId,
        transaction_id: TransactionId,
        reason: Option<String>,
    ) -> Result<TransactionResult> {
        let original = self
            .storage
            .get_transaction(transaction_id)?
            .ok_or_else(|| Error::TransactionNotFound(transaction_id.to_string()))?;

        if original.tenant_id != tenant_id {
            return Err(Error::TenantMismatch(format!(
                "transaction {} does not belong to tenant {}",
                transaction_id, tenant_id
            )));
        }
        if original.kind == TransactionKind::Reversal {
            return Err(Error::InvalidRequest(format!(
                "transaction {} is a reversal and cannot be reversed",
                transaction_id
            )));
        }

        let account = self.accounts.get_account(original.account_id)?;
        let request = PostRequest {
            tenant_id,
            account_type: account.account_type.to_string(),
            amount: -original.amount,
            idempotency_key: reversal_key(original.id),
            kind: TransactionKind::Reversal,
            reference: Reference {
                reference_type: Some(REVERSAL_REFERENCE_TYPE.to_string()),
                reference_id: Some(original.id.to_string()),
            },
            description: reason,
            metadata: Metadata::new(),
        };

        if let Some(existing) = self.storage.find_by_idempotency_key(&request.idempotency_key)? {
            if !is_reversal_of(&existing, original.id) {
                return Err(Error::IdempotencyConflict(format!(
                    "key '{}' is held by transaction {}, not a reversal of {}",
                    request.idempotency_key, existing.id, original.id
                )));
            }
            return self.replay(&request, existing);
        }

        self.execute(&request, account.id).await
    }

    /// Move `amount` of one account type from one tenant to another.
    ///
    /// Posts a debit on the source (`<key>:out`) and then a credit on the
    /// target (`<key>:in`). Both legs are idempotent, so retrying with the
    /// same key after a failure completes the allocation without repeating
    /// the debit.
    pub async fn allocate(&self, request: AllocationRequest) -> Result<AllocationResult> {
        if request.from_tenant == request.to_tenant {
            return Err(Error::InvalidRequest(
                "allocation source and target must differ".to_string(),
            ));
        }
        if !request.amount.is_sign_positive() || request.amount.is_zero() {
            return Err(Error::InvalidRequest("allocation amount must be positive".to_string()));
        }

        let outgoing = PostRequest {
            tenant_id: request.from_tenant,
            account_type: request.account_type.clone(),
            amount: -request.amount,
            idempotency_key: format!("{}{}", request.idempotency_key, ALLOCATION_OUT_SUFFIX),
            kind: TransactionKind::Debit,
            reference: Reference {
                reference_type: Some(ALLOCATION_OUT_REFERENCE_TYPE.to_string()),
                reference_id: Some(request.to_tenant.to_string()),
            },
            description: Some(format!("Allocated {} to tenant {}", request.amount, request.to_tenant)),
            metadata: Metadata::new(),
        };
        let incoming = PostRequest {
            tenant_id: request.to_tenant,
            account_type: request.account_type,
            amount: request.amount,
            idempotency_key: format!("{}{}", request.idempotency_key, ALLOCATION_IN_SUFFIX),
            kind: TransactionKind::Credit,
            reference: Reference {
                reference_type: Some(ALLOCATION_IN_REFERENCE_TYPE.to_string()),
                reference_id: Some(request.from_tenant.to_string()),
            },
            description: Some(format!("Received allocation from tenant {}", request.from_tenant)),
            metadata: Metadata::new(),
        };
        validate(&outgoing)?;
        validate(&incoming)?;

        // Fail before the debit when the credit cannot land
        self.accounts.get_wallet_by_tenant(request.to_tenant)?.ensure_active()?;

        let outgoing = self.post(outgoing).await?;
        let incoming = self.post(incoming).await.map_err(|e| {
            tracing::error!(
                from_tenant = %request.from_tenant,
                to_tenant = %request.to_tenant,
                debit_id = %outgoing.transaction_id,
                error = %e,
                "Allocation credit failed after debit, retry with the same key"
            );
            e
        })?;

        tracing::info!(
            from_tenant = %request.from_tenant,
            to_tenant = %request.to_tenant,
            amount = %request.amount,
            "Allocation applied"
        );

        Ok(AllocationResult { outgoing, incoming })
    }

    async fn execute(&self, request: &PostRequest, account_id: AccountId) -> Result<TransactionResult> {
        let started = Instant::now();

        let outcome = self
            .guard
            .run(account_id, || {
                let account = self.accounts.get_account(account_id)?;
                self.accounts
                    .apply_delta(account_id, request.amount, account.version, |before, balance_after, created_at| {
                        let partition = self.partitions.resolve(created_at);
                        let record = self.build_record(request, before, balance_after, created_at);
                        Ok((record, partition.name))
                    })
            })
            .await;

        match outcome {
            Ok(DeltaOutcome::Applied { account, record }) => {
                self.metrics.record_post(started.elapsed().as_secs_f64());
                tracing::debug!(
                    transaction_id = %record.id,
                    account_id = %account.id,
                    tenant_id = %record.tenant_id,
                    kind = %record.kind,
                    amount = %record.amount,
                    balance_after = %record.balance_after,
                    version = account.version,
                    "Transaction applied"
                );
                Ok(record.result())
            }
            // Same key committed by a concurrent caller
            Ok(DeltaOutcome::Duplicate(existing)) => self.replay(request, existing),
            Err(err @ Error::InsufficientBalance { .. }) => {
                self.metrics.record_insufficient_balance();
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    fn build_record(
        &self,
        request: &PostRequest,
        before: &Account,
        balance_after: Decimal,
        created_at: DateTime<Utc>,
    ) -> TransactionRecord {
        let mut record = TransactionRecord {
            id: TransactionId::generate(),
            tenant_id: request.tenant_id,
            account_id: before.id,
            kind: request.kind,
            amount: request.amount,
            balance_before: before.balance,
            balance_after,
            idempotency_key: request.idempotency_key.clone(),
            reference: request.reference.clone(),
            description: request.description.clone(),
            metadata: request.metadata.clone(),
            previous_transaction_id: before.last_transaction_id,
            previous_hash: before.last_hash,
            hash: GENESIS_HASH,
            signature: None,
            created_at,
        };
        record.hash = record.compute_hash();
        record.signature = self.keypair.as_ref().map(|keypair| keypair.sign(&record.hash));
        record
    }

    fn replay(&self, request: &PostRequest, existing: TransactionRecord) -> Result<TransactionResult> {
        if existing.tenant_id != request.tenant_id {
            return Err(Error::IdempotencyConflict(format!(
                "key '{}' is already used by another tenant",
                request.idempotency_key
            )));
        }

        if existing.amount != request.amount
            || existing.kind != request.kind
            || existing.reference != request.reference
        {
            tracing::warn!(
                idempotency_key = %request.idempotency_key,
                transaction_id = %existing.id,
                original_amount = %existing.amount,
                requested_amount = %request.amount,
                "Idempotent replay with different arguments, returning original result"
            );
        }

        self.metrics.record_replay();
        Ok(existing.result())
    }
}

/// Idempotency key of the reversal of `transaction_id`
pub fn reversal_key(transaction_id: TransactionId) -> String {
    format!("{}{}", REVERSAL_KEY_PREFIX, transaction_id)
}

fn is_reversal_of(record: &TransactionRecord, original: TransactionId) -> bool {
    let original = original.to_string();
    record.kind == TransactionKind::Reversal
        && record.reference.reference_type.as_deref() == Some(REVERSAL_REFERENCE_TYPE)
        && record.reference.reference_id.as_deref() == Some(original.as_str())
}

/// Check a request before it touches any state
fn validate(request: &PostRequest) -> Result<AccountType> {
    let key = &request.idempotency_key;
    if key.trim().is_empty() {
        return Err(Error::InvalidRequest("idempotency key is required".to_string()));
    }
    if key.len() > MAX_IDEMPOTENCY_KEY_LEN {
        return Err(Error::InvalidRequest(format!(
            "idempotency key exceeds {} bytes",
            MAX_IDEMPOTENCY_KEY_LEN
        )));
    }
    if key.starts_with(REVERSAL_KEY_PREFIX) {
        return Err(Error::InvalidRequest(format!(
            "idempotency keys starting with '{}' are reserved",
            REVERSAL_KEY_PREFIX
        )));
    }

    let amount = request.amount;
    if amount.is_zero() {
        return Err(Error::InvalidRequest("amount must be non-zero".to_string()));
    }
    match request.kind {
        TransactionKind::Credit if amount.is_sign_negative() => {
            return Err(Error::InvalidRequest("credit amount must be positive".to_string()));
        }
        TransactionKind::Debit if amount.is_sign_positive() => {
            return Err(Error::InvalidRequest("debit amount must be negative".to_string()));
        }
        TransactionKind::Reversal => {
            return Err(Error::InvalidRequest(
                "reversals are created by reversing a transaction".to_string(),
            ));
        }
        _ => {}
    }

    if amount.normalize().scale() > HASH_DECIMAL_SCALE {
        return Err(Error::InvalidRequest(format!(
            "amount has more than {} fractional digits",
            HASH_DECIMAL_SCALE
        )));
    }
    if amount.abs() >= MAX_BALANCE {
        return Err(Error::InvalidRequest("amount exceeds 12 integer digits".to_string()));
    }

    AccountType::parse(request.account_type.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::Granularity, guard::RetryPolicy, storage::DEFAULT_PARTITION, types::WalletStatus,
        Config,
    };
    use tempfile::TempDir;
    use uuid::Uuid;

    struct Fixture {
        engine: TransactionEngine,
        accounts: Arc<AccountStore>,
        storage: Arc<Storage>,
        _temp: TempDir,
    }

    fn fixture() -> Fixture {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        config.rocksdb.sync_writes = false;

        let storage = Arc::new(Storage::open(&config).unwrap());
        let metrics = Arc::new(Metrics::new().unwrap());
        let partitions =
            Arc::new(PartitionManager::load(storage.clone(), Granularity::Monthly, metrics.clone()).unwrap());
        partitions.ensure_provisioned(1, Utc::now()).unwrap();
        let accounts = Arc::new(AccountStore::new(storage.clone(), config.accounts.clone()));
        let guard = ConsistencyGuard::new(RetryPolicy::from(&config.retry), metrics.clone());
        let engine = TransactionEngine::new(storage.clone(), accounts.clone(), partitions, guard, metrics);

        Fixture {
            engine,
            accounts,
            storage,
            _temp: temp_dir,
        }
    }

    fn tenant() -> TenantId {
        TenantId::from_uuid(Uuid::now_v7())
    }

    fn credit(tenant_id: TenantId, amount: i64, key: &str) -> PostRequest {
        PostRequest::new(tenant_id, "credits", Decimal::from(amount), key, TransactionKind::Credit)
    }

    fn debit(tenant_id: TenantId, amount: i64, key: &str) -> PostRequest {
        PostRequest::new(tenant_id, "credits", Decimal::from(-amount), key, TransactionKind::Debit)
    }

    #[test]
    fn test_validation() {
        let tenant_id = tenant();
        assert!(validate(&credit(tenant_id, 10, "k")).is_ok());
        assert!(validate(&credit(tenant_id, 10, "")).is_err());
        assert!(validate(&credit(tenant_id, 10, &"k".repeat(256))).is_err());
        assert!(validate(&credit(tenant_id, 0, "k")).is_err());
        assert!(validate(&credit(tenant_id, -10, "k")).is_err());
        assert!(validate(&debit(tenant_id, -10, "k")).is_err());

        let mut precise = credit(tenant_id, 1, "k");
        precise.amount = Decimal::new(1, 9);
        assert!(validate(&precise).is_err());
        // Trailing zeros do not count
        precise.amount = Decimal::new(1_000, 11);
        assert!(validate(&precise).is_ok());

        let mut reversal = credit(tenant_id, 1, "k");
        reversal.kind = TransactionKind::Reversal;
        assert!(validate(&reversal).is_err());

        let mut adjustment = credit(tenant_id, -5, "k");
        adjustment.kind = TransactionKind::Adjustment;
        assert!(validate(&adjustment).is_ok());

        let mut bad_type = credit(tenant_id, 1, "k");
        bad_type.account_type = "Bonus Credits".to_string();
        assert!(validate(&bad_type).is_err());
    }

    #[tokio::test]
    async fn test_post_and_replay() {
        let f = fixture();
        let tenant_id = tenant();
        f.accounts.ensure_wallet(tenant_id).unwrap();

        let first = f.engine.post(credit(tenant_id, 100, "a")).await.unwrap();
        assert_eq!(first.balance_before, Decimal::ZERO);
        assert_eq!(first.balance_after, Decimal::from(100));

        let second = f.engine.post(debit(tenant_id, 30, "b")).await.unwrap();
        assert_eq!(second.balance_after, Decimal::from(70));

        let replay = f.engine.post(credit(tenant_id, 100, "a")).await.unwrap();
        assert_eq!(replay, first);

        let account = f.accounts.get_account(first.account_id).unwrap();
        assert_eq!(account.balance, Decimal::from(70));
        assert_eq!(account.version, 3);
    }

    #[tokio::test]
    async fn test_records_chain_hashes() {
        let f = fixture();
        let tenant_id = tenant();
        f.accounts.ensure_wallet(tenant_id).unwrap();

        let first = f.engine.post(credit(tenant_id, 5, "c1")).await.unwrap();
        let second = f.engine.post(credit(tenant_id, 7, "c2")).await.unwrap();

        let first_record = f.storage.get_transaction(first.transaction_id).unwrap().unwrap();
        let second_record = f.storage.get_transaction(second.transaction_id).unwrap().unwrap();
        assert_eq!(first_record.previous_hash, GENESIS_HASH);
        assert_eq!(first_record.previous_transaction_id, None);
        assert_eq!(second_record.previous_hash, first_record.hash);
        assert_eq!(second_record.previous_transaction_id, Some(first_record.id));
        assert_eq!(second_record.hash, second_record.compute_hash());
    }

    #[tokio::test]
    async fn test_insufficient_balance_writes_nothing() {
        let f = fixture();
        let tenant_id = tenant();
        f.accounts.ensure_wallet(tenant_id).unwrap();

        f.engine.post(credit(tenant_id, 10, "seed")).await.unwrap();
        let result = f.engine.post(debit(tenant_id, 11, "over")).await;
        assert!(matches!(result, Err(Error::InsufficientBalance { .. })));
        assert!(f.storage.find_by_idempotency_key("over").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_idempotency_key_is_tenant_scoped() {
        let f = fixture();
        let owner = tenant();
        let intruder = tenant();
        f.accounts.ensure_wallet(owner).unwrap();
        f.accounts.ensure_wallet(intruder).unwrap();

        f.engine.post(credit(owner, 10, "shared")).await.unwrap();
        let result = f.engine.post(credit(intruder, 10, "shared")).await;
        assert!(matches!(result, Err(Error::IdempotencyConflict(_))));
    }

    #[tokio::test]
    async fn test_replay_with_different_amount_returns_original() {
        let f = fixture();
        let tenant_id = tenant();
        f.accounts.ensure_wallet(tenant_id).unwrap();

        let original = f.engine.post(credit(tenant_id, 10, "k")).await.unwrap();
        let replay = f.engine.post(credit(tenant_id, 99, "k")).await.unwrap();
        assert_eq!(replay, original);
        assert_eq!(
            f.accounts.get_account(original.account_id).unwrap().balance,
            Decimal::from(10)
        );
    }

    #[tokio::test]
    async fn test_post_requires_active_wallet() {
        let f = fixture();
        let tenant_id = tenant();
        f.accounts.ensure_wallet(tenant_id).unwrap();
        f.engine.post(credit(tenant_id, 10, "before")).await.unwrap();

        f.accounts.set_wallet_status(tenant_id, WalletStatus::Suspended).unwrap();
        let result = f.engine.post(credit(tenant_id, 10, "during")).await;
        assert!(matches!(result, Err(Error::WalletNotActive { .. })));

        // Unknown tenant
        let result = f.engine.post(credit(tenant(), 10, "nobody")).await;
        assert!(matches!(result, Err(Error::WalletNotFound(_))));
    }

    #[tokio::test]
    async fn test_reverse() {
        let f = fixture();
        let tenant_id = tenant();
        f.accounts.ensure_wallet(tenant_id).unwrap();

        let purchase = f.engine.post(credit(tenant_id, 40, "purchase")).await.unwrap();
        let reversal = f
            .engine
            .reverse(tenant_id, purchase.transaction_id, Some("refund".to_string()))
            .await
            .unwrap();
        assert_eq!(reversal.balance_after, Decimal::ZERO);

        let record = f.storage.get_transaction(reversal.transaction_id).unwrap().unwrap();
        assert_eq!(record.kind, TransactionKind::Reversal);
        assert_eq!(record.amount, Decimal::from(-40));
        assert_eq!(record.reference.reference_type.as_deref(), Some(REVERSAL_REFERENCE_TYPE));
        assert_eq!(record.idempotency_key, reversal_key(purchase.transaction_id));

        // At most once
        let again = f.engine.reverse(tenant_id, purchase.transaction_id, None).await.unwrap();
        assert_eq!(again, reversal);

        let result = f.engine.reverse(tenant_id, reversal.transaction_id, None).await;
        assert!(matches!(result, Err(Error::InvalidRequest(_))));

        let result = f.engine.reverse(tenant(), purchase.transaction_id, None).await;
        assert!(matches!(result, Err(Error::TenantMismatch(_))));
    }

    #[tokio::test]
    async fn test_reversal_of_spent_credit_is_rejected() {
        let f = fixture();
        let tenant_id = tenant();
        f.accounts.ensure_wallet(tenant_id).unwrap();

        let purchase = f.engine.post(credit(tenant_id, 40, "p")).await.unwrap();
        f.engine.post(debit(tenant_id, 30, "usage")).await.unwrap();

        let result = f.engine.reverse(tenant_id, purchase.transaction_id, None).await;
        assert!(matches!(result, Err(Error::InsufficientBalance { .. })));
    }

    #[tokio::test]
    async fn test_signed_records() {
        let mut f = fixture();
        let keypair = Arc::new(KeyPair::from_seed(&[7u8; 32]));
        f.engine.set_keypair(keypair.clone());

        let tenant_id = tenant();
        f.accounts.ensure_wallet(tenant_id).unwrap();
        let result = f.engine.post(credit(tenant_id, 1, "signed")).await.unwrap();

        let record = f.storage.get_transaction(result.transaction_id).unwrap().unwrap();
        let signature = record.signature.unwrap();
        assert!(keypair.verify(&record.hash, &signature).is_ok());
    }

    #[tokio::test]
    async fn test_reserved_reversal_keys_are_rejected() {
        let f = fixture();
        let tenant_id = tenant();
        f.accounts.ensure_wallet(tenant_id).unwrap();

        let purchase = f.engine.post(credit(tenant_id, 40, "buy")).await.unwrap();
        let squatter = credit(tenant_id, 5, &reversal_key(purchase.transaction_id));
        let result = f.engine.post(squatter).await;
        assert!(matches!(result, Err(Error::InvalidRequest(_))));

        // The real reversal is still available
        let reversal = f.engine.reverse(tenant_id, purchase.transaction_id, None).await.unwrap();
        assert_eq!(reversal.balance_after, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_reverse_refuses_foreign_record_under_reversal_key() {
        let f = fixture();
        let tenant_id = tenant();
        f.accounts.ensure_wallet(tenant_id).unwrap();
        let purchase = f.engine.post(credit(tenant_id, 40, "buy")).await.unwrap();

        // A credit stored under the derived key, bypassing validation
        let forged = credit(tenant_id, 5, &reversal_key(purchase.transaction_id));
        let account = f.accounts.get_account(purchase.account_id).unwrap();
        f.accounts
            .apply_delta(account.id, forged.amount, account.version, |before, balance_after, created_at| {
                let record = f.engine.build_record(&forged, before, balance_after, created_at);
                Ok((record, DEFAULT_PARTITION.to_string()))
            })
            .unwrap();

        let result = f.engine.reverse(tenant_id, purchase.transaction_id, None).await;
        assert!(matches!(result, Err(Error::IdempotencyConflict(_))));
        assert_eq!(
            f.accounts.get_account(purchase.account_id).unwrap().balance,
            Decimal::from(45)
        );
    }

    #[tokio::test]
    async fn test_post_checks_account_tenant() {
        let f = fixture();
        let tenant_id = tenant();
        let wallet = f.accounts.ensure_wallet(tenant_id).unwrap();

        let mut foreign = Account::new(&wallet, AccountType::parse("promo").unwrap());
        foreign.tenant_id = tenant();
        f.storage.insert_account_if_absent(foreign).unwrap();

        let request = PostRequest::new(tenant_id, "promo", Decimal::ONE, "p1", TransactionKind::Credit);
        let result = f.engine.post(request).await;
        assert!(matches!(result, Err(Error::TenantMismatch(_))));
    }

    fn allocation(from: TenantId, to: TenantId, amount: i64, key: &str) -> AllocationRequest {
        AllocationRequest {
            from_tenant: from,
            to_tenant: to,
            account_type: "reseller_allocation".to_string(),
            amount: Decimal::from(amount),
            idempotency_key: key.to_string(),
        }
    }

    #[tokio::test]
    async fn test_allocate_moves_balance_once() {
        let f = fixture();
        let reseller = tenant();
        let customer = tenant();
        f.accounts.ensure_wallet(reseller).unwrap();
        f.accounts.ensure_wallet(customer).unwrap();

        let mut seed = credit(reseller, 100, "stock");
        seed.account_type = "reseller_allocation".to_string();
        f.engine.post(seed).await.unwrap();

        let result = f.engine.allocate(allocation(reseller, customer, 30, "alloc-1")).await.unwrap();
        assert_eq!(result.outgoing.balance_after, Decimal::from(70));
        assert_eq!(result.incoming.balance_after, Decimal::from(30));

        let debit = f.storage.get_transaction(result.outgoing.transaction_id).unwrap().unwrap();
        assert_eq!(debit.idempotency_key, "alloc-1:out");
        assert_eq!(debit.reference.reference_type.as_deref(), Some(ALLOCATION_OUT_REFERENCE_TYPE));
        assert_eq!(debit.reference.reference_id, Some(customer.to_string()));
        let credit_leg = f.storage.get_transaction(result.incoming.transaction_id).unwrap().unwrap();
        assert_eq!(credit_leg.idempotency_key, "alloc-1:in");
        assert_eq!(credit_leg.tenant_id, customer);

        // Retrying replays both legs
        let again = f.engine.allocate(allocation(reseller, customer, 30, "alloc-1")).await.unwrap();
        assert_eq!(again, result);
        assert_eq!(
            f.accounts.get_account(result.outgoing.account_id).unwrap().balance,
            Decimal::from(70)
        );
    }

    #[tokio::test]
    async fn test_allocate_rejections_write_nothing() {
        let f = fixture();
        let reseller = tenant();
        let customer = tenant();
        f.accounts.ensure_wallet(reseller).unwrap();
        f.accounts.ensure_wallet(customer).unwrap();

        let result = f.engine.allocate(allocation(reseller, reseller, 1, "self")).await;
        assert!(matches!(result, Err(Error::InvalidRequest(_))));
        let result = f.engine.allocate(allocation(reseller, customer, 0, "zero")).await;
        assert!(matches!(result, Err(Error::InvalidRequest(_))));

        let result = f.engine.allocate(allocation(reseller, customer, 10, "broke")).await;
        assert!(matches!(result, Err(Error::InsufficientBalance { .. })));
        assert!(f.storage.find_by_idempotency_key("broke:in").unwrap().is_none());

        // Suspended target fails before the debit
        let mut seed = credit(reseller, 50, "stock");
        seed.account_type = "reseller_allocation".to_string();
        f.engine.post(seed).await.unwrap();
        f.accounts.set_wallet_status(customer, WalletStatus::Suspended).unwrap();
        let result = f.engine.allocate(allocation(reseller, customer, 10, "held")).await;
        assert!(matches!(result, Err(Error::WalletNotActive { .. })));
        assert!(f.storage.find_by_idempotency_key("held:out").unwrap().is_none());
    }
}
