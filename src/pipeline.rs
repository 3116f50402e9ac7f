//! Multi-lot ingestion over one ledger.
//!
//! Each lot has an explicit [`LotCursor`]; a REJECT blocks only that lot's
//! cursor, while a HALT stops the ledger for everyone.

use std::collections::HashMap;
use std::path::Path;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::error::{FishoilError, Result, ValidationError};
use crate::fields::{FieldId, Fields};
use crate::fraud::{RuleKind, Severity, Verdict};
use crate::ledger::{HaltReason, Ledger};
use crate::receipt::{LotId, Receipt, Stage};
use crate::schema::{self, encapsulation_keys};
use crate::stage::{anomaly_keys, StageOutcome, StageProcessor};
use crate::util;
use crate::verify::{self, LotVerification, VerificationReport};

/// Continuation state of one lot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LotCursor {
    pub lot_id: LotId,
    /// `None` once DISTRIBUTION has been accepted.
    pub next_stage: Option<Stage>,
    /// `payload_hash` of the lot's last accepted stage receipt.
    pub last_good_hash: Option<String>,
    /// Tracked fields of every accepted stage so far.
    pub carried: Fields,
    pub blocked: Option<Verdict>,
}

impl LotCursor {
    fn new(lot_id: LotId) -> Self {
        Self {
            lot_id,
            next_stage: Some(Stage::Catch),
            last_good_hash: None,
            carried: Fields::new(),
            blocked: None,
        }
    }

    fn accept(&mut self, receipt: &Receipt) {
        self.carried.carry_from(&receipt.fields);
        self.last_good_hash = Some(receipt.payload_hash.clone());
        self.next_stage = receipt.stage.next();
    }

    pub fn is_complete(&self) -> bool {
        self.next_stage.is_none() && self.blocked.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Stage receipt appended (verdict OK or FLAG), followed by any anomaly
    /// receipts.
    Advanced {
        sequence_number: u64,
        verdict: Verdict,
        anomaly_sequences: Vec<u64>,
    },
    /// No stage receipt; the lot is now blocked.
    Rejected {
        verdict: Verdict,
        anomaly_sequences: Vec<u64>,
    },
}

impl SubmitOutcome {
    pub fn verdict(&self) -> Verdict {
        match self {
            SubmitOutcome::Advanced { verdict, .. } | SubmitOutcome::Rejected { verdict, .. } => *verdict,
        }
    }

    pub fn anomaly_sequences(&self) -> &[u64] {
        match self {
            SubmitOutcome::Advanced { anomaly_sequences, .. }
            | SubmitOutcome::Rejected { anomaly_sequences, .. } => anomaly_sequences,
        }
    }
}

#[derive(Debug)]
pub struct Pipeline {
    ledger: Ledger,
    processor: StageProcessor,
    lots: HashMap<LotId, LotCursor>,
    /// Assigned lot number -> owning lot.
    lot_numbers: HashMap<String, LotId>,
}

impl Pipeline {
    /// Take ownership of `ledger` and rebuild every lot cursor from its
    /// committed receipts.
    pub fn resume(ledger: Ledger, processor: StageProcessor) -> Result<Self> {
        let mut lots: HashMap<LotId, LotCursor> = HashMap::new();
        let mut lot_numbers: HashMap<String, LotId> = HashMap::new();
        for receipt in ledger.read_all()? {
            let receipt = receipt?;
            let cursor = lots
                .entry(receipt.lot_id.clone())
                .or_insert_with(|| LotCursor::new(receipt.lot_id.clone()));
            if receipt.is_anomaly() {
                if let Some(verdict) = rejection_of(&receipt) {
                    cursor.blocked.get_or_insert(verdict);
                }
            } else {
                if receipt.stage == Stage::Encapsulation {
                    if let Some(n) = receipt.fields.named_str(encapsulation_keys::LOT_NUMBER) {
                        lot_numbers.insert(n.to_string(), receipt.lot_id.clone());
                    }
                }
                cursor.accept(&receipt);
            }
        }
        info!(
            path = %ledger.path().display(),
            lots = lots.len(),
            blocked = lots.values().filter(|c| c.blocked.is_some()).count(),
            "pipeline resumed"
        );
        Ok(Self { ledger, processor, lots, lot_numbers })
    }

    /// Open the ledger at `path` and resume from it.
    pub fn open(path: &Path, processor: StageProcessor) -> Result<Self> {
        Self::resume(Ledger::open(path)?, processor)
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn into_ledger(self) -> Ledger {
        self.ledger
    }

    pub fn processor(&self) -> &StageProcessor {
        &self.processor
    }

    pub fn cursor(&self, lot: &LotId) -> Option<&LotCursor> {
        self.lots.get(lot)
    }

    pub fn lots(&self) -> impl Iterator<Item = &LotCursor> {
        self.lots.values()
    }

    /// Process and append one stage for `lot`.
    ///
    /// Stages must arrive in pipeline order. Every receipt chains off the
    /// ledger tail. REJECT blocks the lot for good, then appends the
    /// anomaly receipts; HALT halts the ledger and returns `LedgerHalted`.
    /// At ENCAPSULATION a lot number is assigned when none is given, and a
    /// number already held by another lot is refused.
    pub fn submit(&mut self, lot: &LotId, stage: Stage, mut fields: Fields) -> Result<SubmitOutcome> {
        if let Some(reason) = self.ledger.halt_status() {
            return Err(FishoilError::LedgerHalted(reason));
        }

        let cursor = self
            .lots
            .entry(lot.clone())
            .or_insert_with(|| LotCursor::new(lot.clone()));
        if cursor.blocked.is_some() {
            return Err(FishoilError::LotBlocked(lot.clone()));
        }
        if cursor.next_stage != Some(stage) {
            return Err(FishoilError::StageOrder {
                lot: lot.clone(),
                expected: cursor
                    .next_stage
                    .map_or_else(|| "none (lot complete)".to_string(), |s| s.to_string()),
                found: stage,
            });
        }
        let carried = cursor.carried.clone();

        let lot_number = match stage {
            Stage::Encapsulation => Some(self.assign_lot_number(lot, &mut fields, &carried)?),
            _ => None,
        };

        let previous = self.ledger.tail_receipt();
        let outcome = self
            .processor
            .process(stage, lot, previous.as_ref(), fields, &carried)?;

        match outcome {
            StageOutcome::Halted { verdict, assessment } => {
                let detail = assessment
                    .findings
                    .iter()
                    .find(|f| f.severity() == Severity::Halt)
                    .map_or_else(|| verdict.to_string(), |f| f.detail.clone());
                let reason = HaltReason::new(verdict.kind().unwrap_or(RuleKind::Integrity), detail);
                error!(lot = %lot, stage = %stage, reason = %reason, "HALT verdict");
                self.ledger.halt(reason.clone())?;
                Err(FishoilError::LedgerHalted(reason))
            }
            StageOutcome::Rejected { verdict, anomalies, .. } => self.reject(lot, stage, verdict, anomalies),
            StageOutcome::Accepted { receipt, assessment, anomalies } => {
                let verdict = assessment.verdict();
                let sequence_number = self.ledger.append(receipt.clone())?;
                if let Some(cursor) = self.lots.get_mut(lot) {
                    cursor.accept(&receipt);
                }
                if let Some(number) = lot_number {
                    self.lot_numbers.insert(number, lot.clone());
                }
                let anomaly_sequences = self.record_anomalies(lot, stage, anomalies)?;
                info!(lot = %lot, stage = %stage, seq = sequence_number, verdict = %verdict, "stage accepted");
                Ok(SubmitOutcome::Advanced { sequence_number, verdict, anomaly_sequences })
            }
        }
    }

    /// Per-lot verification against the committed ledger. The lot is also
    /// invalid when its last stage receipt on disk is not the one this
    /// pipeline accepted.
    pub fn verify_lot(&self, lot: &LotId) -> Result<LotVerification> {
        let receipts = self.ledger.snapshot()?;
        let mut check = verify::verify_lot(&receipts, lot);
        let accepted = self.lots.get(lot).and_then(|c| c.last_good_hash.as_deref());
        let diverged = check.last_stage().map(|s| s.payload_hash.as_str()) != accepted;
        if diverged {
            warn!(lot = %lot, accepted = ?accepted, "lot tail on disk diverges from pipeline state");
            check.valid = false;
        }
        Ok(check)
    }

    /// Lot holding `lot_number`, if any.
    pub fn lot_for_number(&self, lot_number: &str) -> Option<&LotId> {
        self.lot_numbers.get(lot_number)
    }

    fn assign_lot_number(&self, lot: &LotId, fields: &mut Fields, carried: &Fields) -> Result<String> {
        schema::validate(Stage::Encapsulation, fields)?;
        let number = match fields.named_str(encapsulation_keys::LOT_NUMBER) {
            Some(n) => n.to_string(),
            None => {
                let batch_id = carried.record::<String>(FieldId::BATCH_ID)?.unwrap_or_default();
                let n = util::generate_lot_number(&batch_id, schema::fill_date(fields)?);
                fields.set_named(encapsulation_keys::LOT_NUMBER, &n)?;
                debug!(lot = %lot, lot_number = %n, "lot number generated");
                n
            }
        };
        if let Some(holder) = self.lot_numbers.get(&number) {
            warn!(lot = %lot, holder = %holder, lot_number = %number, "duplicate lot number");
            return Err(ValidationError::DuplicateLotNumber(number).into());
        }
        Ok(number)
    }

    fn reject(&mut self, lot: &LotId, stage: Stage, verdict: Verdict, anomalies: Vec<Receipt>) -> Result<SubmitOutcome> {
        self.lots
            .entry(lot.clone())
            .or_insert_with(|| LotCursor::new(lot.clone()))
            .blocked = Some(verdict);
        warn!(lot = %lot, stage = %stage, verdict = %verdict, "lot rejected");
        let anomaly_sequences = self.record_anomalies(lot, stage, anomalies)?;
        Ok(SubmitOutcome::Rejected { verdict, anomaly_sequences })
    }

    /// Append anomaly receipts in order. A finding that cannot be recorded
    /// halts the ledger and the append error is returned.
    fn record_anomalies(&self, lot: &LotId, stage: Stage, anomalies: Vec<Receipt>) -> Result<Vec<u64>> {
        let mut sequences = Vec::with_capacity(anomalies.len());
        for a in anomalies {
            let flag = a.fields.named_str(anomaly_keys::FLAG).unwrap_or_default().to_string();
            match self.ledger.append(a) {
                Ok(seq) => {
                    warn!(lot = %lot, stage = %stage, flag = %flag, seq, "anomaly recorded");
                    sequences.push(seq);
                }
                Err(e) => {
                    let reason = HaltReason::integrity(format!(
                        "anomaly {flag} for lot {lot} could not be recorded: {e}"
                    ));
                    if let Err(halt_err) = self.ledger.halt(reason) {
                        error!(lot = %lot, error = %halt_err, "could not halt after lost anomaly");
                    }
                    return Err(e);
                }
            }
        }
        Ok(sequences)
    }

    /// Verify the whole ledger; any violation halts it with an INTEGRITY
    /// reason.
    pub fn verify_integrity(&self, published_root: Option<&str>) -> Result<VerificationReport> {
        let report = verify::verify_ledger(&self.ledger, published_root)?;
        if report.ok {
            info!(receipts = report.receipt_count, root = %report.merkle_root, "ledger integrity verified");
        } else {
            let detail = match report.first_violation_sequence {
                Some(seq) => format!("chain verification failed at sequence {seq}"),
                None => "published Merkle root does not match".to_string(),
            };
            self.ledger.halt(HaltReason::integrity(detail))?;
        }
        Ok(report)
    }
}

fn rejection_of(anomaly: &Receipt) -> Option<Verdict> {
    let severity: Severity = serde_json::from_value(anomaly.fields.get_named(anomaly_keys::SEVERITY)?.clone()).ok()?;
    if severity < Severity::Reject {
        return None;
    }
    let kind: RuleKind = serde_json::from_value(anomaly.fields.get_named(anomaly_keys::RULE)?.clone()).ok()?;
    Some(Verdict::Reject(kind))
}
