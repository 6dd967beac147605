//! Error types for the wallet ledger

use rust_decimal::Decimal;
use thiserror::Error;

use crate::types::{AccountId, WalletStatus};

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ledger errors
#[derive(Error, Debug)]
pub enum Error {
    /// Storage error (RocksDB)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Request failed validation before touching any state
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// No wallet for the tenant
    #[error("Wallet not found for tenant {0}")]
    WalletNotFound(String),

    /// Tenant already has a wallet
    #[error("Wallet already exists for tenant {0}")]
    WalletAlreadyExists(String),

    /// Wallet is suspended or closed
    #[error("Wallet {wallet_id} is not active (status: {status})")]
    WalletNotActive {
        /// Wallet that rejected the operation
        wallet_id: String,
        /// Its current status
        status: WalletStatus,
    },

    /// Administrative status change not permitted
    #[error("Invalid wallet status transition: {from} -> {to}")]
    InvalidStatusTransition {
        /// Current status
        from: WalletStatus,
        /// Requested status
        to: WalletStatus,
    },

    /// Account or transaction does not belong to the stated tenant
    #[error("Tenant mismatch: {0}")]
    TenantMismatch(String),

    /// Account not found
    #[error("Account not found: {0}")]
    AccountNotFound(String),

    /// Transaction not found
    #[error("Transaction not found: {0}")]
    TransactionNotFound(String),

    /// Balance would drop below the permitted floor
    #[error("Insufficient balance on account {account_id}: balance {balance}, requested {requested}")]
    InsufficientBalance {
        /// Account that rejected the debit
        account_id: AccountId,
        /// Balance at the time of the check
        balance: Decimal,
        /// Signed delta that was requested
        requested: Decimal,
    },

    /// Optimistic lock lost: the account moved past the expected version
    #[error("Version conflict on account {account_id}: expected {expected}, found {actual}")]
    VersionConflict {
        /// Contended account
        account_id: AccountId,
        /// Version the writer read
        expected: u64,
        /// Version found at commit time
        actual: u64,
    },

    /// Retries exhausted under sustained contention
    #[error("Concurrency exhausted on account {account_id} after {attempts} attempts")]
    ConcurrencyExhausted {
        /// Contended account
        account_id: AccountId,
        /// Attempts made
        attempts: u32,
    },

    /// Idempotency key already used by a different tenant
    #[error("Idempotency key conflict: {0}")]
    IdempotencyConflict(String),

    /// Signature verification failed
    #[error("Signature verification failed: {0}")]
    SignatureError(String),

    /// Concurrency error (maintenance mailbox closed, etc.)
    #[error("Concurrency error: {0}")]
    Concurrency(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the caller may retry the whole operation with the same
    /// idempotency key.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConcurrencyExhausted { .. } | Error::VersionConflict { .. }
        )
    }
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Storage(err.to_string())
    }
}
