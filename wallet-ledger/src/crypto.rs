//! Cryptographic operations for the ledger
//!
//! This module provides:
//! - The SHA-256 chain hash linking each transaction to its predecessor
//! - Ed25519 key pairs for optional signing of transaction hashes

use crate::types::{AccountId, Hash, Signature, TransactionId};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature as DalekSignature, Signer, SigningKey, Verifier, VerifyingKey};
use rust_decimal::Decimal;
use sha2::{Digest, Sha256};

/// Fractional digits used when hashing decimal fields
pub const HASH_DECIMAL_SCALE: u32 = 8;

/// Compute a transaction's chain hash
///
/// `H(previous_hash ‖ id ‖ account_id ‖ amount ‖ balance_after ‖ timestamp)`.
/// Decimals are hashed as length-prefixed strings rescaled to
/// [`HASH_DECIMAL_SCALE`] digits so `100` and `100.00` hash identically;
/// the timestamp as big-endian nanoseconds since the Unix epoch.
pub fn chain_hash(
    previous_hash: &Hash,
    id: TransactionId,
    account_id: AccountId,
    amount: Decimal,
    balance_after: Decimal,
    created_at: DateTime<Utc>,
) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(previous_hash);
    hasher.update(id.as_bytes());
    hasher.update(account_id.as_bytes());
    update_decimal(&mut hasher, amount);
    update_decimal(&mut hasher, balance_after);
    hasher.update(created_at.timestamp_nanos_opt().unwrap_or(0).to_be_bytes());
    hasher.finalize().into()
}

fn update_decimal(hasher: &mut Sha256, value: Decimal) {
    let canonical = canonical_decimal(value);
    hasher.update((canonical.len() as u32).to_be_bytes());
    hasher.update(canonical.as_bytes());
}

/// Fixed-scale string form of a decimal
pub fn canonical_decimal(value: Decimal) -> String {
    let mut scaled = value.round_dp(HASH_DECIMAL_SCALE);
    scaled.rescale(HASH_DECIMAL_SCALE);
    scaled.to_string()
}

/// Ed25519 key pair for signing
#[derive(Debug)]
pub struct KeyPair {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl KeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        Self::from_seed(&rand::random::<[u8; 32]>())
    }

    /// Create from seed (32 bytes) - deterministic generation
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(seed);
        let verifying_key = signing_key.verifying_key();

        Self {
            signing_key,
            verifying_key,
        }
    }

    /// Load from a hex-encoded 32-byte seed
    pub fn from_seed_hex(seed_hex: &str) -> Result<Self> {
        let bytes = hex::decode(seed_hex.trim())
            .map_err(|e| Error::Config(format!("Invalid signing seed: {}", e)))?;
        let seed: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| Error::Config("Signing seed must be 32 bytes".to_string()))?;
        Ok(Self::from_seed(&seed))
    }

    /// Get public key bytes
    pub fn public_key(&self) -> [u8; 32] {
        self.verifying_key.to_bytes()
    }

    /// Sign a message
    pub fn sign(&self, message: &[u8]) -> Signature {
        let signature = self.signing_key.sign(message);
        Signature::from_bytes(signature.to_bytes())
    }

    /// Verify a signature
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<()> {
        let bytes = signature
            .to_array()
            .ok_or_else(|| Error::SignatureError("Malformed signature".to_string()))?;
        let dalek_sig = DalekSignature::from_bytes(&bytes);
        self.verifying_key
            .verify(message, &dalek_sig)
            .map_err(|e| Error::SignatureError(format!("Verification failed: {}", e)))
    }
}
