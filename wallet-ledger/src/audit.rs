//! Hash-chain verification
//!
//! Replays an account's history in time order and reports every record
//! whose stored data no longer matches what the chain says it should be.
//! Nothing here writes; integrity problems are reported, never repaired.

use crate::{
    storage::{Storage, CURSOR_LEN},
    types::{Account, AccountId, Hash, TransactionId, TransactionRecord, GENESIS_HASH},
    Error, Result,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// History entries fetched per storage scan
const SCAN_BATCH: usize = 512;

/// What is wrong with a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BreakKind {
    /// Indexed but absent from its partition
    MissingRecord,
    /// Recomputed hash differs from the stored one
    HashMismatch,
    /// Stored previous hash differs from the predecessor's hash
    ChainGap,
    /// `balance_after != balance_before + amount`
    BalanceMismatch,
    /// Missing or invalid signature
    BadSignature,
}

impl fmt::Display for BreakKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BreakKind::MissingRecord => "missing_record",
            BreakKind::HashMismatch => "hash_mismatch",
            BreakKind::ChainGap => "chain_gap",
            BreakKind::BalanceMismatch => "balance_mismatch",
            BreakKind::BadSignature => "bad_signature",
        };
        f.write_str(name)
    }
}

/// One integrity failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainBreak {
    /// Offending transaction
    pub transaction_id: TransactionId,
    /// Failure kind
    pub kind: BreakKind,
}

/// Result of verifying one account over a time range
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationReport {
    /// Verified account
    pub account_id: AccountId,
    /// Range start (inclusive)
    pub from: DateTime<Utc>,
    /// Range end (exclusive)
    pub to: DateTime<Utc>,
    /// Records examined
    pub checked: usize,
    /// Breaks in chronological order, at most one per record
    pub breaks: Vec<ChainBreak>,
}

impl VerificationReport {
    /// Earliest break
    pub fn first_break(&self) -> Option<&ChainBreak> {
        self.breaks.first()
    }

    /// No breaks found
    pub fn is_clean(&self) -> bool {
        self.breaks.is_empty()
    }
}

/// Sum of an account's history against its balance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConservationReport {
    /// Verified account
    pub account_id: AccountId,
    /// Current balance
    pub balance: Decimal,
    /// Sum of every recorded amount
    pub sum_of_amounts: Decimal,
    /// Records summed
    pub transactions: usize,
}

impl ConservationReport {
    /// Balance equals the sum of amounts
    pub fn holds(&self) -> bool {
        self.balance == self.sum_of_amounts
    }
}

/// Hash-chain verifier
#[derive(Debug)]
pub struct AuditVerifier {
    storage: Arc<Storage>,
    public_key: Option<[u8; 32]>,
}

impl AuditVerifier {
    /// Create a verifier; signatures are checked only with a public key
    pub fn new(storage: Arc<Storage>, public_key: Option<[u8; 32]>) -> Self {
        Self { storage, public_key }
    }

    /// Check signatures against `public_key` from now on
    pub fn set_public_key(&mut self, public_key: [u8; 32]) {
        self.public_key = Some(public_key);
    }

    /// Verify the chain of `account_id` for records in `[from, to)`
    pub fn verify_chain(
        &self,
        account_id: AccountId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<VerificationReport> {
        let account = self
            .storage
            .get_account(account_id)?
            .ok_or_else(|| Error::AccountNotFound(account_id.to_string()))?;

        // None when the predecessor itself is unreadable
        let mut expected_previous: Option<Hash> = match self.storage.last_history_before(account_id, from)? {
            Some(entry) => entry.record.map(|record| record.hash),
            None => Some(GENESIS_HASH),
        };

        let mut report = VerificationReport {
            account_id,
            from,
            to,
            checked: 0,
            breaks: Vec::new(),
        };

        // The account's latest transaction as found by the scan, with its
        // stored hash if readable. Later records are concurrent appends.
        let head_id = account.last_transaction_id;
        let mut head_seen: Option<Option<Hash>> = None;

        let mut cursor: Option<Vec<u8>> = None;
        loop {
            let entries = self
                .storage
                .scan_history(account_id, from, to, cursor.as_deref(), SCAN_BATCH)?;
            let exhausted = entries.len() < SCAN_BATCH;

            for entry in entries {
                report.checked += 1;
                debug_assert_eq!(entry.cursor.len(), CURSOR_LEN);

                match &entry.record {
                    None => {
                        report.breaks.push(ChainBreak {
                            transaction_id: entry.transaction_id,
                            kind: BreakKind::MissingRecord,
                        });
                        expected_previous = None;
                        if Some(entry.transaction_id) == head_id {
                            head_seen = Some(None);
                        }
                    }
                    Some(record) => {
                        if let Some(kind) = self.check_record(record, expected_previous) {
                            tracing::warn!(
                                account_id = %account_id,
                                transaction_id = %record.id,
                                kind = %kind,
                                "Hash chain break"
                            );
                            report.breaks.push(ChainBreak {
                                transaction_id: record.id,
                                kind,
                            });
                        }
                        expected_previous = Some(record.hash);
                        if Some(record.id) == head_id {
                            head_seen = Some(Some(record.hash));
                        }
                    }
                }

                cursor = Some(entry.cursor);
            }

            if exhausted {
                break;
            }
        }

        if let Some(head) = self.check_head(&account, from, to, head_seen, &report.breaks) {
            tracing::warn!(
                account_id = %account_id,
                transaction_id = %head.transaction_id,
                kind = %head.kind,
                "Account head does not match history"
            );
            report.breaks.push(head);
        }

        tracing::info!(
            account_id = %account_id,
            checked = report.checked,
            breaks = report.breaks.len(),
            "Chain verified"
        );

        Ok(report)
    }

    /// When the range covers the account's latest transaction, the scan must
    /// have found it with the hash the account holds.
    fn check_head(
        &self,
        account: &Account,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        head_seen: Option<Option<Hash>>,
        breaks: &[ChainBreak],
    ) -> Option<ChainBreak> {
        let head_id = account.last_transaction_id?;
        let head_at = account.last_transaction_at?;
        if head_at < from || head_at >= to {
            return None;
        }

        match head_seen {
            None => Some(ChainBreak {
                transaction_id: head_id,
                kind: BreakKind::MissingRecord,
            }),
            Some(Some(hash))
                if hash != account.last_hash && !breaks.iter().any(|b| b.transaction_id == head_id) =>
            {
                Some(ChainBreak {
                    transaction_id: head_id,
                    kind: BreakKind::ChainGap,
                })
            }
            // Unreadable head is already a MissingRecord
            Some(_) => None,
        }
    }

    fn check_record(&self, record: &TransactionRecord, expected_previous: Option<Hash>) -> Option<BreakKind> {
        if record.compute_hash() != record.hash {
            return Some(BreakKind::HashMismatch);
        }
        if expected_previous.is_some_and(|previous| previous != record.previous_hash) {
            return Some(BreakKind::ChainGap);
        }
        if record.balance_before + record.amount != record.balance_after {
            return Some(BreakKind::BalanceMismatch);
        }
        if let Some(public_key) = &self.public_key {
            let valid = record
                .signature
                .as_ref()
                .is_some_and(|signature| signature.verify(&record.hash, public_key));
            if !valid {
                return Some(BreakKind::BadSignature);
            }
        }
        None
    }

    /// Check that the account's balance equals the sum of its history
    pub fn verify_conservation(&self, account_id: AccountId) -> Result<ConservationReport> {
        let account = self
            .storage
            .get_account(account_id)?
            .ok_or_else(|| Error::AccountNotFound(account_id.to_string()))?;

        let mut sum_of_amounts = Decimal::ZERO;
        let mut transactions = 0;
        let mut cursor: Option<Vec<u8>> = None;
        loop {
            let entries = self.storage.scan_history(
                account_id,
                DateTime::<Utc>::MIN_UTC,
                DateTime::<Utc>::MAX_UTC,
                cursor.as_deref(),
                SCAN_BATCH,
            )?;
            let exhausted = entries.len() < SCAN_BATCH;

            for entry in entries {
                if let Some(record) = &entry.record {
                    sum_of_amounts += record.amount;
                    transactions += 1;
                }
                cursor = Some(entry.cursor);
            }

            if exhausted {
                break;
            }
        }

        let report = ConservationReport {
            account_id,
            balance: account.balance,
            sum_of_amounts,
            transactions,
        };
        if !report.holds() {
            tracing::warn!(
                account_id = %account_id,
                balance = %report.balance,
                sum_of_amounts = %report.sum_of_amounts,
                "Balance does not match history"
            );
        }
        Ok(report)
    }
}
