//! Core types for the wallet ledger
//!
//! All types are designed for:
//! - Deterministic serialization (bincode)
//! - Exact arithmetic (Decimal for money, never floating point)
//! - Explicit tenant scoping (no ambient tenant context)

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// SHA-256 digest used for the per-account hash chain
pub type Hash = [u8; 32];

/// Previous-hash value of the first transaction on every account
pub const GENESIS_HASH: Hash = [0u8; 32];

/// Free-form string metadata attached to wallets and transactions
pub type Metadata = BTreeMap<String, String>;

macro_rules! uuid_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            /// Wrap an existing UUID
            pub fn from_uuid(id: Uuid) -> Self {
                Self(id)
            }

            /// Raw 16 bytes, used for storage keys and hashing
            pub fn as_bytes(&self) -> &[u8; 16] {
                self.0.as_bytes()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }
    };
}

uuid_id!(
    /// Tenant identifier, resolved by the calling layer
    TenantId
);
uuid_id!(
    /// Wallet identifier
    WalletId
);
uuid_id!(
    /// Account (balance bucket) identifier
    AccountId
);
uuid_id!(
    /// Transaction identifier (UUIDv7, time-ordered)
    TransactionId
);

impl WalletId {
    pub(crate) fn generate() -> Self {
        Self(Uuid::now_v7())
    }
}

impl AccountId {
    pub(crate) fn generate() -> Self {
        Self(Uuid::now_v7())
    }
}

impl TransactionId {
    pub(crate) fn generate() -> Self {
        Self(Uuid::now_v7())
    }
}

/// Typed balance bucket name (`credits`, `bonus`, `reseller_allocation`, ...)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AccountType(String);

impl AccountType {
    /// Maximum length of an account type name
    pub const MAX_LEN: usize = 64;

    /// Parse and validate an account type: `[a-z0-9_]{1,64}`
    pub fn parse(name: impl Into<String>) -> crate::Result<Self> {
        let name = name.into();
        if name.is_empty() || name.len() > Self::MAX_LEN {
            return Err(crate::Error::InvalidRequest(format!(
                "account type must be 1..={} characters",
                Self::MAX_LEN
            )));
        }
        if !name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_')
        {
            return Err(crate::Error::InvalidRequest(format!(
                "account type '{}' may only contain [a-z0-9_]",
                name
            )));
        }
        Ok(Self(name))
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// ISO 4217 currency code, fixed per wallet at creation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[non_exhaustive]
pub enum Currency {
    /// Indian Rupee
    #[default]
    INR,
    /// US Dollar
    USD,
    /// Euro
    EUR,
    /// British Pound
    GBP,
    /// UAE Dirham
    AED,
}

impl Currency {
    /// ISO 4217 code
    pub fn code(&self) -> &'static str {
        match self {
            Currency::INR => "INR",
            Currency::USD => "USD",
            Currency::EUR => "EUR",
            Currency::GBP => "GBP",
            Currency::AED => "AED",
        }
    }

    /// Parse from an ISO code
    pub fn from_code(s: &str) -> Option<Self> {
        match s {
            "INR" => Some(Currency::INR),
            "USD" => Some(Currency::USD),
            "EUR" => Some(Currency::EUR),
            "GBP" => Some(Currency::GBP),
            "AED" => Some(Currency::AED),
            _ => None,
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Wallet lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum WalletStatus {
    /// Accepts transactions
    Active = 1,
    /// Temporarily frozen by an administrator
    Suspended = 2,
    /// Soft-closed, terminal
    Closed = 3,
}

impl WalletStatus {
    /// Lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            WalletStatus::Active => "active",
            WalletStatus::Suspended => "suspended",
            WalletStatus::Closed => "closed",
        }
    }

    /// Whether an administrator may move a wallet from `self` to `next`
    pub fn can_transition_to(&self, next: WalletStatus) -> bool {
        use WalletStatus::*;
        match (self, next) {
            (Closed, _) => false,
            (Active, Suspended) | (Suspended, Active) => true,
            (Active, Closed) | (Suspended, Closed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for WalletStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-tenant financial container
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wallet {
    /// Wallet ID
    pub id: WalletId,
    /// Owning tenant (unique)
    pub tenant_id: TenantId,
    /// Currency, fixed at creation
    pub currency: Currency,
    /// Lifecycle status
    pub status: WalletStatus,
    /// Free-form metadata
    #[serde(default)]
    pub metadata: Metadata,
    /// Created timestamp
    pub created_at: DateTime<Utc>,
    /// Last status change
    pub updated_at: DateTime<Utc>,
}

impl Wallet {
    /// Error unless the wallet may transact
    pub fn ensure_active(&self) -> crate::Result<()> {
        if self.status != WalletStatus::Active {
            return Err(crate::Error::WalletNotActive {
                wallet_id: self.id.to_string(),
                status: self.status,
            });
        }
        Ok(())
    }
}

/// Typed balance bucket within a wallet
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    /// Account ID
    pub id: AccountId,
    /// Parent wallet
    pub wallet_id: WalletId,
    /// Owning tenant (denormalized for ownership checks)
    pub tenant_id: TenantId,
    /// Bucket type, unique within the wallet
    pub account_type: AccountType,
    /// Current balance
    pub balance: Decimal,
    /// Optimistic-lock version, +1 per applied transaction
    pub version: u64,
    /// Most recent transaction applied to this account
    pub last_transaction_id: Option<TransactionId>,
    /// Hash of the most recent transaction (genesis when none)
    pub last_hash: Hash,
    /// Timestamp of the most recent transaction
    pub last_transaction_at: Option<DateTime<Utc>>,
    /// Created timestamp
    pub created_at: DateTime<Utc>,
    /// Last mutation timestamp
    pub updated_at: DateTime<Utc>,
}

impl Account {
    /// Version of an account that has never transacted
    pub const INITIAL_VERSION: u64 = 1;

    pub(crate) fn new(wallet: &Wallet, account_type: AccountType) -> Self {
        let now = Utc::now();
        Self {
            id: AccountId::generate(),
            wallet_id: wallet.id,
            tenant_id: wallet.tenant_id,
            account_type,
            balance: Decimal::ZERO,
            version: Self::INITIAL_VERSION,
            last_transaction_id: None,
            last_hash: GENESIS_HASH,
            last_transaction_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Transaction kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum TransactionKind {
    /// Positive delta (purchase, top-up)
    Credit = 1,
    /// Negative delta (usage)
    Debit = 2,
    /// Full-amount correction of an earlier transaction
    Reversal = 3,
    /// Administrative correction, either sign
    Adjustment = 4,
}

impl TransactionKind {
    /// Lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Credit => "credit",
            TransactionKind::Debit => "debit",
            TransactionKind::Reversal => "reversal",
            TransactionKind::Adjustment => "adjustment",
        }
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Link to the business event that originated a transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Reference {
    /// Reference type (`payment`, `campaign`, `reversal`, ...)
    pub reference_type: Option<String>,
    /// Reference id within that type
    pub reference_id: Option<String>,
}

/// Immutable, hash-chained transaction record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    /// Transaction ID (UUIDv7)
    pub id: TransactionId,
    /// Owning tenant
    pub tenant_id: TenantId,
    /// Target account
    pub account_id: AccountId,
    /// Kind
    pub kind: TransactionKind,
    /// Signed delta
    pub amount: Decimal,
    /// Balance before the delta
    pub balance_before: Decimal,
    /// Balance after the delta
    pub balance_after: Decimal,
    /// Caller-supplied idempotency key (globally unique)
    pub idempotency_key: String,
    /// Originating business event
    pub reference: Reference,
    /// Human-readable description
    pub description: Option<String>,
    /// Free-form metadata
    #[serde(default)]
    pub metadata: Metadata,
    /// Previous transaction on the same account
    pub previous_transaction_id: Option<TransactionId>,
    /// Hash of the previous transaction on the same account
    pub previous_hash: Hash,
    /// Hash of this transaction
    pub hash: Hash,
    /// Optional Ed25519 signature over `hash`
    pub signature: Option<Signature>,
    /// Creation timestamp (partition key)
    pub created_at: DateTime<Utc>,
}

impl TransactionRecord {
    /// Hash the record's chained fields
    pub fn compute_hash(&self) -> Hash {
        crate::crypto::chain_hash(
            &self.previous_hash,
            self.id,
            self.account_id,
            self.amount,
            self.balance_after,
            self.created_at,
        )
    }

    /// Lowercase hex of the hash, 64 characters
    pub fn hash_hex(&self) -> String {
        hex::encode(self.hash)
    }

    /// Result returned to callers (identical for replays)
    pub fn result(&self) -> TransactionResult {
        TransactionResult {
            transaction_id: self.id,
            account_id: self.account_id,
            balance_before: self.balance_before,
            balance_after: self.balance_after,
            hash: self.hash,
            created_at: self.created_at,
        }
    }
}

/// Outcome of a post or reversal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionResult {
    /// Transaction ID
    pub transaction_id: TransactionId,
    /// Account the delta was applied to
    pub account_id: AccountId,
    /// Balance before
    pub balance_before: Decimal,
    /// Balance after
    pub balance_after: Decimal,
    /// Chain hash
    pub hash: Hash,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

/// Balance-changing request accepted by the ledger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostRequest {
    /// Resolved tenant
    pub tenant_id: TenantId,
    /// Target account type (created lazily)
    pub account_type: String,
    /// Signed delta
    pub amount: Decimal,
    /// Caller-supplied idempotency key
    pub idempotency_key: String,
    /// Kind
    pub kind: TransactionKind,
    /// Originating business event
    #[serde(default)]
    pub reference: Reference,
    /// Description
    pub description: Option<String>,
    /// Metadata
    #[serde(default)]
    pub metadata: Metadata,
}

impl PostRequest {
    /// Create a request with no reference, description or metadata
    pub fn new(
        tenant_id: TenantId,
        account_type: impl Into<String>,
        amount: Decimal,
        idempotency_key: impl Into<String>,
        kind: TransactionKind,
    ) -> Self {
        Self {
            tenant_id,
            account_type: account_type.into(),
            amount,
            idempotency_key: idempotency_key.into(),
            kind,
            reference: Reference::default(),
            description: None,
            metadata: Metadata::new(),
        }
    }

    /// Attach the originating business event
    pub fn with_reference(
        mut self,
        reference_type: impl Into<String>,
        reference_id: impl Into<String>,
    ) -> Self {
        self.reference = Reference {
            reference_type: Some(reference_type.into()),
            reference_id: Some(reference_id.into()),
        };
        self
    }

    /// Attach a description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Add one metadata entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Transfer of balance between two tenants' accounts of the same type
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationRequest {
    /// Tenant debited
    pub from_tenant: TenantId,
    /// Tenant credited
    pub to_tenant: TenantId,
    /// Account type on both sides
    pub account_type: String,
    /// Positive amount moved
    pub amount: Decimal,
    /// Caller key; each leg derives its own key from it
    pub idempotency_key: String,
}

/// Both legs of an allocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationResult {
    /// Debit on the source tenant
    pub outgoing: TransactionResult,
    /// Credit on the target tenant
    pub incoming: TransactionResult,
}

/// Read-only balance snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceView {
    /// Balance
    pub balance: Decimal,
    /// Version (0 when the account does not exist yet)
    pub version: u64,
}

/// One page of an account's history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionPage {
    /// Transactions, ascending by time
    pub transactions: Vec<TransactionRecord>,
    /// Opaque token for the next page, `None` on the last page
    pub next_page_token: Option<String>,
}

/// Digital signature (Ed25519, 64 bytes)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    #[serde(with = "serde_bytes")]
    bytes: Vec<u8>,
}

impl Signature {
    /// Create from bytes
    pub fn from_bytes(bytes: [u8; 64]) -> Self {
        Self {
            bytes: bytes.to_vec(),
        }
    }

    /// Get bytes, `None` if the stored value is malformed
    pub fn to_array(&self) -> Option<[u8; 64]> {
        self.bytes.as_slice().try_into().ok()
    }

    /// Verify signature
    pub fn verify(&self, message: &[u8], public_key: &[u8; 32]) -> bool {
        use ed25519_dalek::{Signature as DalekSignature, Verifier, VerifyingKey};

        let Some(bytes) = self.to_array() else {
            return false;
        };
        let signature = DalekSignature::from_bytes(&bytes);

        let verifying_key = match VerifyingKey::from_bytes(public_key) {
            Ok(key) => key,
            Err(_) => return false,
        };

        verifying_key.verify(message, &signature).is_ok()
    }
}
