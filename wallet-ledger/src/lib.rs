//! Wallet Ledger
//!
//! Multi-tenant balance ledger with exactly-once postings, per-account hash
//! chains and a time-partitioned transaction log on RocksDB.
//!
//! # Architecture
//!
//! - **AccountStore**: one wallet per tenant, typed accounts with a version counter
//! - **TransactionEngine**: validation, idempotency and hash chaining
//! - **ConsistencyGuard**: optimistic-lock retries with jittered backoff
//! - **PartitionManager**: monthly (or daily) log segments plus a catch-all
//! - **AuditVerifier**: replays hash chains to detect tampering
//!
//! # Invariants
//!
//! - `balance_after = balance_before + amount` for every record
//! - An idempotency key is applied at most once, across all tenants and time
//! - Per account: versions, timestamps and hashes form one total order
//! - Records are never updated or deleted; corrections are reversals

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod accounts;
pub mod audit;
pub mod config;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod guard;
pub mod ledger;
pub mod maintenance;
pub mod metrics;
pub mod partition;
pub mod storage;
pub mod types;

// Re-exports
pub use audit::{BreakKind, ChainBreak, ConservationReport, VerificationReport};
pub use config::Config;
pub use error::{Error, Result};
pub use ledger::Ledger;
pub use partition::{PartitionHandle, PartitionInfo};
pub use storage::Storage;
pub use types::{
    Account, AccountId, AccountType, AllocationRequest, AllocationResult, BalanceView, Currency, PostRequest, Reference, TenantId,
    TransactionId, TransactionKind, TransactionPage, TransactionRecord, TransactionResult, Wallet,
    WalletId, WalletStatus,
};
