//! Wallets and typed accounts
//!
//! One wallet per tenant, any number of typed accounts per wallet. Account
//! balances change only through [`AccountStore::apply_delta`], which commits
//! the new balance and the transaction record describing it together.

use crate::{
    config::AccountsConfig,
    storage::{CommitOutcome, Storage},
    types::{
        Account, AccountId, AccountType, Currency, Metadata, TenantId, TransactionRecord, Wallet,
        WalletId, WalletStatus,
    },
    Error, Result,
};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;

/// Largest absolute balance an account may hold (12 integer digits)
pub const MAX_BALANCE: Decimal = Decimal::from_parts(3_567_587_328, 232, 0, false, 0);

/// Result of [`AccountStore::apply_delta`]
#[derive(Debug)]
pub enum DeltaOutcome {
    /// Delta applied; the account's new state and its record
    Applied {
        /// Account after the delta
        account: Account,
        /// Record committed with it
        record: TransactionRecord,
    },
    /// The record's idempotency key was committed concurrently
    Duplicate(TransactionRecord),
}

/// Wallet and account store
#[derive(Debug)]
pub struct AccountStore {
    storage: Arc<Storage>,
    config: AccountsConfig,
}

impl AccountStore {
    /// Create a store over `storage`
    pub fn new(storage: Arc<Storage>, config: AccountsConfig) -> Self {
        Self { storage, config }
    }

    /// Create the tenant's wallet with the default account types
    pub fn create_wallet(
        &self,
        tenant_id: TenantId,
        currency: Option<Currency>,
        metadata: Metadata,
    ) -> Result<Wallet> {
        let now = Utc::now();
        let wallet = Wallet {
            id: WalletId::generate(),
            tenant_id,
            currency: currency.unwrap_or(self.config.default_currency),
            status: WalletStatus::Active,
            metadata,
            created_at: now,
            updated_at: now,
        };

        let accounts = self
            .config
            .default_account_types
            .iter()
            .map(|name| AccountType::parse(name.as_str()).map(|t| Account::new(&wallet, t)))
            .collect::<Result<Vec<_>>>()?;

        self.storage.insert_wallet(&wallet, &accounts)?;

        tracing::info!(
            tenant_id = %tenant_id,
            wallet_id = %wallet.id,
            currency = %wallet.currency,
            accounts = accounts.len(),
            "Wallet created"
        );

        Ok(wallet)
    }

    /// Get the tenant's wallet, creating it if missing
    pub fn ensure_wallet(&self, tenant_id: TenantId) -> Result<Wallet> {
        if let Some(wallet) = self.storage.get_wallet_by_tenant(tenant_id)? {
            return Ok(wallet);
        }

        match self.create_wallet(tenant_id, None, Metadata::new()) {
            // Lost the creation race
            Err(Error::WalletAlreadyExists(_)) => self.get_wallet_by_tenant(tenant_id),
            other => other,
        }
    }

    /// Get the tenant's wallet
    pub fn get_wallet_by_tenant(&self, tenant_id: TenantId) -> Result<Wallet> {
        self.storage
            .get_wallet_by_tenant(tenant_id)?
            .ok_or_else(|| Error::WalletNotFound(tenant_id.to_string()))
    }

    /// Administrative status change. Setting the current status is a no-op.
    pub fn set_wallet_status(&self, tenant_id: TenantId, status: WalletStatus) -> Result<Wallet> {
        let wallet = self.get_wallet_by_tenant(tenant_id)?;

        let updated = self.storage.update_wallet(wallet.id, |wallet| {
            if wallet.status == status {
                return Ok(());
            }
            if !wallet.status.can_transition_to(status) {
                return Err(Error::InvalidStatusTransition {
                    from: wallet.status,
                    to: status,
                });
            }
            wallet.status = status;
            wallet.updated_at = Utc::now();
            Ok(())
        })?;

        tracing::info!(
            tenant_id = %tenant_id,
            wallet_id = %updated.id,
            status = %updated.status,
            "Wallet status set"
        );

        Ok(updated)
    }

    /// Look up or lazily create the `(wallet, type)` account
    pub fn get_or_create_account(&self, wallet_id: WalletId, account_type: &AccountType) -> Result<Account> {
        let wallet = self
            .storage
            .get_wallet(wallet_id)?
            .ok_or_else(|| Error::WalletNotFound(wallet_id.to_string()))?;
        wallet.ensure_active()?;

        if let Some(account) = self.storage.find_account(wallet_id, account_type)? {
            return Ok(account);
        }

        self.storage
            .insert_account_if_absent(Account::new(&wallet, account_type.clone()))
    }

    /// Find the `(wallet, type)` account without creating it
    pub fn find_account(&self, wallet_id: WalletId, account_type: &AccountType) -> Result<Option<Account>> {
        self.storage.find_account(wallet_id, account_type)
    }

    /// Get account by ID
    pub fn get_account(&self, account_id: AccountId) -> Result<Account> {
        self.storage
            .get_account(account_id)?
            .ok_or_else(|| Error::AccountNotFound(account_id.to_string()))
    }

    /// Apply a signed delta if the account is still at `expected_version`.
    ///
    /// `build_record` receives the account before the delta, the new
    /// balance and the transaction timestamp, and returns the record plus
    /// the partition it goes to. On a version mismatch nothing is written
    /// and `VersionConflict` is returned.
    pub fn apply_delta<F>(
        &self,
        account_id: AccountId,
        amount: Decimal,
        expected_version: u64,
        build_record: F,
    ) -> Result<DeltaOutcome>
    where
        F: FnOnce(&Account, Decimal, DateTime<Utc>) -> Result<(TransactionRecord, String)>,
    {
        let current = self.get_account(account_id)?;
        if current.version != expected_version {
            return Err(Error::VersionConflict {
                account_id,
                expected: expected_version,
                actual: current.version,
            });
        }

        let balance_after = current
            .balance
            .checked_add(amount)
            .filter(|balance| balance.abs() < MAX_BALANCE)
            .ok_or_else(|| Error::InvalidRequest(format!("Balance of account {} would overflow", account_id)))?;

        if amount.is_sign_negative() {
            let policy = self.config.overdraft_for(current.account_type.as_str());
            if let Some(floor) = policy.floor() {
                if balance_after < floor {
                    return Err(Error::InsufficientBalance {
                        account_id,
                        balance: current.balance,
                        requested: amount,
                    });
                }
            }
        }

        // Strictly increasing per account, even if the clock steps back
        let now = Utc::now();
        let created_at = match current.last_transaction_at {
            Some(last) if now <= last => last + Duration::nanoseconds(1),
            _ => now,
        };

        let (record, partition) = build_record(&current, balance_after, created_at)?;

        let mut next = current.clone();
        next.balance = balance_after;
        next.version = expected_version + 1;
        next.last_transaction_id = Some(record.id);
        next.last_hash = record.hash;
        next.last_transaction_at = Some(record.created_at);
        next.updated_at = now;

        match self.storage.commit(expected_version, &next, &record, &partition)? {
            CommitOutcome::Applied => Ok(DeltaOutcome::Applied { account: next, record }),
            CommitOutcome::Duplicate(existing) => Ok(DeltaOutcome::Duplicate(existing)),
        }
    }
}
