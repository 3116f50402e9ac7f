//! ChainVerifier: read-only replay of a ledger snapshot.
//!
//! Sequence numbers in reports are 1-based ledger positions.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;
use crate::hash;
use crate::ledger::Ledger;
use crate::merkle::MerkleTree;
use crate::receipt::{LotId, Receipt, Stage};
use crate::stage::anomaly_keys;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ViolationKind {
    /// Stored `payload_hash` differs from the recomputed one.
    PayloadHashMismatch,
    /// `previous_hash` differs from the prior receipt's stored `payload_hash`.
    PreviousHashMismatch,
    /// Stored `sequence_number` differs from the receipt's position.
    SequenceGap,
    /// The line could not be parsed as a receipt.
    Unreadable,
    /// Recomputed Merkle root differs from the published one.
    MerkleRootMismatch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    /// `None` for batch-level violations.
    pub sequence_number: Option<u64>,
    pub kind: ViolationKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub ok: bool,
    pub verified_count: u64,
    pub first_violation_sequence: Option<u64>,
    pub merkle_root: String,
    pub tail_hash: String,
    pub receipt_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_root: Option<String>,
    pub violations: Vec<Violation>,
}

impl VerificationReport {
    /// No per-receipt violation (a Merkle root mismatch alone keeps this true).
    pub fn chain_ok(&self) -> bool {
        self.first_violation_sequence.is_none()
    }
}

pub struct ChainVerifier;

impl ChainVerifier {
    /// Verify an in-memory snapshot. `published_root` (hex) is cross-checked
    /// against the Merkle root over all stored `payload_hash` values.
    pub fn verify(receipts: &[Receipt], published_root: Option<&str>) -> VerificationReport {
        Self::verify_entries(receipts.iter().map(Some), published_root)
    }

    /// Like [`ChainVerifier::verify`]; `None` entries are unreadable lines.
    ///
    /// Per-receipt link checks stop at the first violation. Receipts after
    /// it are still checked for self-consistency so the report bounds the
    /// damage, but they never count as verified.
    pub fn verify_entries<'a, I>(entries: I, published_root: Option<&str>) -> VerificationReport
    where
        I: IntoIterator<Item = Option<&'a Receipt>>,
    {
        let mut violations = Vec::new();
        let mut first: Option<u64> = None;
        let mut verified = 0u64;
        let mut expected_prev = hash::genesis_hash().to_string();
        let mut leaves: Vec<&str> = Vec::new();
        let mut count = 0u64;

        for (i, entry) in entries.into_iter().enumerate() {
            let pos = i as u64 + 1;
            count = pos;
            let Some(r) = entry else {
                violations.push(Violation { sequence_number: Some(pos), kind: ViolationKind::Unreadable });
                first.get_or_insert(pos);
                continue;
            };
            leaves.push(&r.payload_hash);

            if first.is_none() {
                let kind = if r.sequence_number != pos {
                    Some(ViolationKind::SequenceGap)
                } else if r.previous_hash != expected_prev {
                    Some(ViolationKind::PreviousHashMismatch)
                } else if !r.is_self_consistent() {
                    Some(ViolationKind::PayloadHashMismatch)
                } else {
                    None
                };
                match kind {
                    Some(kind) => {
                        violations.push(Violation { sequence_number: Some(pos), kind });
                        first = Some(pos);
                    }
                    None => verified += 1,
                }
            } else if !r.is_self_consistent() {
                violations.push(Violation {
                    sequence_number: Some(pos),
                    kind: ViolationKind::PayloadHashMismatch,
                });
            }
            expected_prev.clone_from(&r.payload_hash);
        }

        let merkle_root = MerkleTree::build(&leaves).root_hex();
        if let Some(published) = published_root {
            if published != merkle_root {
                violations.push(Violation { sequence_number: None, kind: ViolationKind::MerkleRootMismatch });
            }
        }

        let tail_hash = if count == 0 {
            hash::genesis_hash().to_string()
        } else {
            leaves.last().map_or_else(String::new, |h| (*h).to_string())
        };

        let report = VerificationReport {
            ok: violations.is_empty(),
            verified_count: verified,
            first_violation_sequence: first,
            merkle_root,
            tail_hash,
            receipt_count: count,
            published_root: published_root.map(str::to_string),
            violations,
        };
        debug!(
            ok = report.ok,
            verified = report.verified_count,
            first_violation = ?report.first_violation_sequence,
            "chain verified"
        );
        report
    }
}

/// Verify everything currently committed to `ledger`.
pub fn verify_ledger(ledger: &Ledger, published_root: Option<&str>) -> Result<VerificationReport> {
    let entries: Vec<Option<Receipt>> = ledger.read_all()?.map(|r| r.ok()).collect();
    Ok(ChainVerifier::verify_entries(entries.iter().map(Option::as_ref), published_root))
}

// ---------------------------------------------------------------------------
// Per-lot verification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LotStageEntry {
    pub stage: Stage,
    pub sequence_number: u64,
    pub payload_hash: String,
    pub hash_valid: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LotVerification {
    pub lot_id: LotId,
    pub stages: Vec<LotStageEntry>,
    pub anomaly_flags: Vec<String>,
    /// All five pipeline stages present.
    pub complete: bool,
    /// Stage receipts appear in pipeline order without repeats.
    pub stage_order_ok: bool,
    pub hashes_valid: bool,
    pub valid: bool,
}

impl LotVerification {
    /// The lot's most recent stage receipt entry.
    pub fn last_stage(&self) -> Option<&LotStageEntry> {
        self.stages.last()
    }
}

/// Walk the lot's receipts in `snapshot`: self-hash, stage order,
/// completeness, and anomaly flags.
pub fn verify_lot(snapshot: &[Receipt], lot: &LotId) -> LotVerification {
    let mut stages = Vec::new();
    let mut anomaly_flags = Vec::new();
    for r in snapshot.iter().filter(|r| &r.lot_id == lot) {
        if r.is_anomaly() {
            if let Some(flag) = r.fields.named_str(anomaly_keys::FLAG) {
                anomaly_flags.push(flag.to_string());
            }
            continue;
        }
        stages.push(LotStageEntry {
            stage: r.stage,
            sequence_number: r.sequence_number,
            payload_hash: r.payload_hash.clone(),
            hash_valid: r.is_self_consistent(),
        });
    }

    let stage_order_ok = stages
        .iter()
        .zip(Stage::PIPELINE.iter())
        .all(|(entry, expected)| entry.stage == *expected)
        && stages.len() <= Stage::PIPELINE.len()
        && stages.windows(2).all(|w| w[0].sequence_number < w[1].sequence_number);
    let complete = stages.len() == Stage::PIPELINE.len() && stage_order_ok;
    let hashes_valid = stages.iter().all(|s| s.hash_valid);

    LotVerification {
        lot_id: lot.clone(),
        valid: complete && stage_order_ok && hashes_valid,
        stages,
        anomaly_flags,
        complete,
        stage_order_ok,
        hashes_valid,
    }
}
