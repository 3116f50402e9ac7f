//! StageProcessor: turns one stage's raw field values into the receipts that
//! should be appended for it.
//!
//! Processing is pure. Nothing here touches the ledger, so verification can
//! replay stage outputs without mutating storage.

use time::OffsetDateTime;
use tracing::debug;

use crate::error::Result;
use crate::fields::Fields;
use crate::fraud::{Assessment, Finding, FraudEngine, RuleContext, Verdict};
use crate::hash;
use crate::receipt::{compute_payload_hash, LotId, Receipt, Stage};
use crate::schema;
use crate::util;

/// Named keys carried by ANOMALY receipts.
pub mod anomaly_keys {
    pub const FLAG: &str = "flag";
    pub const RULE: &str = "rule";
    pub const SEVERITY: &str = "severity";
    pub const DETAIL: &str = "detail";
    pub const SOURCE_STAGE: &str = "source_stage";
    /// `payload_hash` of the receipt the anomaly is about. For a rejected
    /// stage this is the hash the receipt would have had; it is never
    /// appended.
    pub const EVIDENCE_HASH: &str = "evidence_hash";
}

#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    /// OK or FLAG: the stage receipt, then one AnomalyReceipt per FLAG
    /// finding chained off it.
    Accepted {
        receipt: Receipt,
        assessment: Assessment,
        anomalies: Vec<Receipt>,
    },
    /// REJECT: no stage receipt. AnomalyReceipts recording every finding,
    /// chained off the previous receipt.
    Rejected {
        verdict: Verdict,
        assessment: Assessment,
        anomalies: Vec<Receipt>,
    },
    /// HALT: nothing may be appended.
    Halted {
        verdict: Verdict,
        assessment: Assessment,
    },
}

impl StageOutcome {
    pub fn verdict(&self) -> Verdict {
        match self {
            StageOutcome::Accepted { assessment, .. } => assessment.verdict(),
            StageOutcome::Rejected { verdict, .. } | StageOutcome::Halted { verdict, .. } => *verdict,
        }
    }

    pub fn assessment(&self) -> &Assessment {
        match self {
            StageOutcome::Accepted { assessment, .. }
            | StageOutcome::Rejected { assessment, .. }
            | StageOutcome::Halted { assessment, .. } => assessment,
        }
    }

    /// Receipts to append, in chain order.
    pub fn receipts(&self) -> Vec<&Receipt> {
        match self {
            StageOutcome::Accepted { receipt, anomalies, .. } => {
                std::iter::once(receipt).chain(anomalies.iter()).collect()
            }
            StageOutcome::Rejected { anomalies, .. } => anomalies.iter().collect(),
            StageOutcome::Halted { .. } => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct StageProcessor {
    engine: FraudEngine,
}

impl StageProcessor {
    pub fn new(engine: FraudEngine) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &FraudEngine {
        &self.engine
    }

    /// Build the receipts for `stage` of `lot`, chaining off `previous`
    /// (the chain head) or the genesis sentinel.
    ///
    /// `carried` holds tracked fields from this lot's earlier stages (the
    /// yield rule needs the catch weight).
    pub fn process(
        &self,
        stage: Stage,
        lot: &LotId,
        previous: Option<&Receipt>,
        fields: Fields,
        carried: &Fields,
    ) -> Result<StageOutcome> {
        self.process_at(stage, lot, previous, fields, carried, util::now_utc())
    }

    /// [`StageProcessor::process`] with an explicit timestamp.
    pub fn process_at(
        &self,
        stage: Stage,
        lot: &LotId,
        previous: Option<&Receipt>,
        fields: Fields,
        carried: &Fields,
        at: OffsetDateTime,
    ) -> Result<StageOutcome> {
        schema::validate(stage, &fields)?;

        let previous_hash = previous.map_or_else(|| hash::genesis_hash().to_string(), |r| r.payload_hash.clone());
        let chain_intact = previous.map_or(true, Receipt::is_self_consistent);

        let assessment = self.engine.evaluate(&RuleContext {
            stage,
            fields: &fields,
            carried,
            chain_intact,
        });
        let verdict = assessment.verdict();
        debug!(lot = %lot, stage = %stage, verdict = %verdict, findings = assessment.findings.len(), "stage evaluated");

        match verdict {
            Verdict::Halt(_) => Ok(StageOutcome::Halted { verdict, assessment }),
            Verdict::Reject(_) => {
                let evidence = compute_payload_hash(stage, lot, &fields, &previous_hash)?;
                let anomalies =
                    chain_anomalies(lot, stage, &evidence, &previous_hash, assessment.findings.iter(), at)?;
                Ok(StageOutcome::Rejected { verdict, assessment, anomalies })
            }
            Verdict::Ok | Verdict::Flag(_) => {
                let receipt = Receipt::new(stage, lot.clone(), fields, previous_hash, at)?;
                let anomalies = chain_anomalies(
                    lot,
                    stage,
                    &receipt.payload_hash,
                    &receipt.payload_hash,
                    assessment.flags(),
                    at,
                )?;
                Ok(StageOutcome::Accepted { receipt, assessment, anomalies })
            }
        }
    }
}

/// Build one AnomalyReceipt for `finding`, linked to `previous_hash`.
pub fn anomaly_receipt(
    lot: &LotId,
    finding: &Finding,
    source_stage: Stage,
    evidence_hash: &str,
    previous_hash: &str,
    at: OffsetDateTime,
) -> Result<Receipt> {
    use anomaly_keys::*;
    let fields = Fields::new()
        .with_named(FLAG, &finding.flag_id())?
        .with_named(RULE, &finding.kind)?
        .with_named(SEVERITY, &finding.severity())?
        .with_named(DETAIL, &finding.detail)?
        .with_named(SOURCE_STAGE, &source_stage)?
        .with_named(EVIDENCE_HASH, &evidence_hash)?;
    Receipt::new(Stage::Anomaly, lot.clone(), fields, previous_hash, at)
}

fn chain_anomalies<'a>(
    lot: &LotId,
    source_stage: Stage,
    evidence_hash: &str,
    start_hash: &str,
    findings: impl Iterator<Item = &'a Finding>,
    at: OffsetDateTime,
) -> Result<Vec<Receipt>> {
    let mut out: Vec<Receipt> = Vec::new();
    for finding in findings {
        let prev = out.last().map_or(start_hash, |r| r.payload_hash.as_str());
        let receipt = anomaly_receipt(lot, finding, source_stage, evidence_hash, prev, at)?;
        debug!(lot = %lot, flag = %finding.flag_id(), "anomaly receipt built");
        out.push(receipt);
    }
    Ok(out)
}
