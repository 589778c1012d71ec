//! Transaction journal
//!
//! Append-only record of every overlay a session has produced, in
//! transaction order. Each entry links to the previous one via a hash
//! chain, so a journal restored from storage can be checked for gaps or
//! reordering.
//!
//! # Core Invariant
//!
//! > `reduce(baseline, applied overlays) -> state`
//!
//! Replaying the applied overlays of a journal in order reproduces the
//! session's current state.

use serde::{Deserialize, Serialize};

use crate::delta::{Overlay, TxStatus};
use crate::types::TransactionId;

/// Hash of the empty journal (FNV offset basis)
pub const GENESIS_HASH: u64 = 0xcbf2_9ce4_8422_2325;

const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// One journaled transaction.
///
/// The hash covers the previous hash, the sequence number and the overlay
/// operations; the status is mutable and not hashed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub hash: u64,
    pub prev_hash: u64,
    pub seq: u64,
    pub overlay: Overlay,
}

impl JournalEntry {
    pub fn transaction(&self) -> TransactionId {
        self.overlay.transaction
    }

    pub fn status(&self) -> TxStatus {
        self.overlay.status
    }
}

/// Hash-chained transaction log
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Journal {
    entries: Vec<JournalEntry>,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an overlay, returning the entry hash
    pub fn append(&mut self, overlay: Overlay) -> u64 {
        let prev_hash = self.head_hash();
        let seq = self.entries.len() as u64;
        let hash = compute_hash(prev_hash, seq, &overlay);
        self.entries.push(JournalEntry {
            hash,
            prev_hash,
            seq,
            overlay,
        });
        hash
    }

    /// Hash of the last entry
    pub fn head_hash(&self) -> u64 {
        self.entries.last().map(|e| e.hash).unwrap_or(GENESIS_HASH)
    }

    pub fn get(&self, tx: TransactionId) -> Option<&JournalEntry> {
        self.entries.iter().find(|e| e.transaction() == tx)
    }

    /// Update the status of `tx`; returns false if it is unknown
    pub fn set_status(&mut self, tx: TransactionId, status: TxStatus) -> bool {
        match self.entries.iter_mut().find(|e| e.transaction() == tx) {
            Some(entry) => {
                entry.overlay.status = status;
                true
            }
            None => false,
        }
    }

    pub fn entries(&self) -> &[JournalEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Applied overlays in transaction order
    pub fn applied(&self) -> impl Iterator<Item = &Overlay> {
        self.entries
            .iter()
            .filter(|e| e.status() == TxStatus::Applied)
            .map(|e| &e.overlay)
    }

    pub fn last_transaction(&self) -> Option<TransactionId> {
        self.entries.last().map(JournalEntry::transaction)
    }

    /// Recompute the chain and check every link
    pub fn verify_integrity(&self) -> bool {
        let mut prev = GENESIS_HASH;
        for (seq, entry) in self.entries.iter().enumerate() {
            if entry.prev_hash != prev
                || entry.seq != seq as u64
                || entry.hash != compute_hash(prev, entry.seq, &entry.overlay)
            {
                return false;
            }
            prev = entry.hash;
        }
        true
    }
}

/// FNV-1a over the chain link, sequence, transaction id and operations
fn compute_hash(prev_hash: u64, seq: u64, overlay: &Overlay) -> u64 {
    let mut hash = GENESIS_HASH;
    let mut feed = |bytes: &[u8]| {
        for byte in bytes {
            hash ^= *byte as u64;
            hash = hash.wrapping_mul(FNV_PRIME);
        }
    };

    feed(&prev_hash.to_le_bytes());
    feed(&seq.to_le_bytes());
    feed(&overlay.transaction.to_le_bytes());
    // Ops hold only derived structs, sets and sequences, with no maps and
    // no custom serializers, so encoding cannot fail and is stable
    feed(&serde_json::to_vec(&overlay.ops).unwrap_or_default());

    hash
}
