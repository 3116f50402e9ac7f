//! Consumer-facing outputs: lot summary, QR verification payload, and the
//! offline verification pack (JSON).

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{FishoilError, OptionExt as _, Result, ResultExt as _};
use crate::fields::{CertScheme, ColdChain, Contaminants, FieldId, Fields, FisheryCertification, Oxidation, Potency};
use crate::fraud::{self, FraudEngine, FraudThresholds};
use crate::merkle::{self, MerkleProof, MerkleTree};
use crate::receipt::{LotId, Receipt, Stage};
use crate::schema::encapsulation_keys;
use crate::util;
use crate::verify::{self, ChainVerifier, LotVerification, VerificationReport};

// ---------------------------------------------------------------------------
// Lot summary
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LotSummary {
    pub lot_id: LotId,
    pub lot_number: Option<String>,
    pub fill_date: Option<String>,
    pub chain_length: usize,
    pub species: Option<String>,
    pub species_scientific: Option<String>,
    pub fishery_certified: bool,
    pub fishery_cert: String,
    pub contaminants_pass: Option<bool>,
    pub potency_verified: Option<String>,
    pub potency_pass: Option<bool>,
    pub totox: Option<f64>,
    /// Peroxide, anisidine and TOTOX each within their limit (inclusive).
    pub oxidation_pass: Option<bool>,
    pub yield_normal: Option<bool>,
    /// `None` when no cold-chain log was recorded for the shipment.
    pub cold_chain_verified: Option<bool>,
    pub anomaly_flags: Vec<String>,
}

fn stage_fields<'a>(receipts: &'a [Receipt], lot: &LotId, stage: Stage) -> Option<&'a Fields> {
    receipts
        .iter()
        .find(|r| &r.lot_id == lot && r.stage == stage)
        .map(|r| &r.fields)
}

fn record<T: serde::de::DeserializeOwned>(fields: Option<&Fields>, id: FieldId) -> Option<T> {
    fields?.record(id).ok().flatten()
}

impl LotSummary {
    pub fn from_receipts(receipts: &[Receipt], lot: &LotId, thresholds: &FraudThresholds) -> Self {
        let lot_check = verify::verify_lot(receipts, lot);
        let catch = stage_fields(receipts, lot, Stage::Catch);
        let processing = stage_fields(receipts, lot, Stage::Processing);
        let testing = stage_fields(receipts, lot, Stage::Testing);
        let encapsulation = stage_fields(receipts, lot, Stage::Encapsulation);
        let distribution = stage_fields(receipts, lot, Stage::Distribution);

        let species_scientific: Option<String> = record(catch, FieldId::SPECIES);
        let species = species_scientific
            .as_deref()
            .map(|s| fraud::common_name(s).unwrap_or("Unknown").to_string());

        let cert: Option<FisheryCertification> = record(catch, FieldId::FISHERY_CERTIFICATION);
        let fishery_cert = match cert.as_ref().map(|c| c.scheme) {
            Some(CertScheme::Msc) => "MSC",
            Some(CertScheme::FriendOfSea) => "FriendOfSea",
            Some(CertScheme::None) | None => "None",
        }
        .to_string();

        let contaminants_pass = record::<Contaminants>(testing, FieldId::CONTAMINANTS).map(|c| {
            c.mercury_ppm <= thresholds.mercury_max_ppm
                && c.pcbs_ppm <= thresholds.pcbs_max_ppm
                && c.dioxins_pg_per_g <= thresholds.dioxins_max_pg_per_g
        });

        let potency: Option<Potency> = record(testing, FieldId::POTENCY);
        let potency_verified = potency.as_ref().map(|p| {
            format!("{:.0}mg EPA+DHA (label: {:.0}mg)", p.total_omega3_mg(), p.label_claim_mg)
        });
        let potency_pass = potency
            .as_ref()
            .map(|p| p.total_omega3_mg() / p.label_claim_mg >= thresholds.potency_min_ratio);

        let oxidation: Option<Oxidation> = record(testing, FieldId::OXIDATION);
        let totox = oxidation.as_ref().map(Oxidation::totox);
        let oxidation_pass = oxidation.as_ref().map(|o| {
            o.peroxide_meq_per_kg <= thresholds.peroxide_max_meq_per_kg
                && o.anisidine <= thresholds.anisidine_max
                && o.totox() <= thresholds.totox_max
        });
        let attribute = |name: &str| {
            encapsulation
                .and_then(|f| f.named_str(name))
                .map(str::to_string)
        };

        let yield_normal = processing.and_then(|p| {
            let carried = catch.cloned().unwrap_or_default();
            FraudEngine::yield_ratio(p, &carried)
        })
        .map(|r| r >= thresholds.yield_min_ratio && r <= thresholds.yield_max_ratio);

        let cold_chain_verified = record::<ColdChain>(distribution, FieldId::COLD_CHAIN).map(|c| {
            c.max_temp_c <= thresholds.cold_chain_max_temp_c
                && c.deviation_count <= thresholds.cold_chain_max_deviations
        });

        Self {
            lot_id: lot.clone(),
            lot_number: attribute(encapsulation_keys::LOT_NUMBER),
            fill_date: attribute(encapsulation_keys::FILL_DATE),
            chain_length: lot_check.stages.len(),
            species,
            species_scientific,
            fishery_certified: cert.is_some_and(|c| c.is_claimed()),
            fishery_cert,
            contaminants_pass,
            potency_verified,
            potency_pass,
            totox,
            oxidation_pass,
            yield_normal,
            cold_chain_verified,
            anomaly_flags: lot_check.anomaly_flags,
        }
    }
}

// ---------------------------------------------------------------------------
// QR payload
// ---------------------------------------------------------------------------

pub const DEFAULT_VERIFY_BASE_URL: &str = "https://verify.fishoilproof.io";

/// Everything an external verifier needs to check one lot's final receipt
/// against the ledger's Merkle root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QrPayload {
    pub lot_id: LotId,
    pub valid: bool,
    pub tail_hash: String,
    pub merkle_root: String,
    pub payload_hash: String,
    pub sequence_number: u64,
    pub proof: MerkleProof,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<LotSummary>,
    pub verification_url: String,
}

impl QrPayload {
    /// Build the payload for `lot` from a full ledger snapshot.
    ///
    /// `valid` requires both an intact chain and a complete, well-ordered
    /// lot.
    pub fn for_lot(
        receipts: &[Receipt],
        lot: &LotId,
        base_url: &str,
        thresholds: &FraudThresholds,
    ) -> Result<Self> {
        let chain = ChainVerifier::verify(receipts, None);
        let lot_check: LotVerification = verify::verify_lot(receipts, lot);
        let last = lot_check
            .last_stage()
            .required_report(&format!("no stage receipts for lot {lot}"))?;

        let index = receipts
            .iter()
            .position(|r| r.payload_hash == last.payload_hash && r.sequence_number == last.sequence_number)
            .required_report("final lot receipt not in snapshot")?;
        let leaves: Vec<&str> = receipts.iter().map(|r| r.payload_hash.as_str()).collect();
        let tree = MerkleTree::build(&leaves);
        let proof = tree.prove(index).required_report("merkle proof out of range")?;

        Ok(Self {
            lot_id: lot.clone(),
            valid: chain.ok && lot_check.valid,
            tail_hash: chain.tail_hash,
            merkle_root: tree.root_hex(),
            payload_hash: last.payload_hash.clone(),
            sequence_number: last.sequence_number,
            proof,
            summary: Some(LotSummary::from_receipts(receipts, lot, thresholds)),
            verification_url: format!("{}/{}", base_url.trim_end_matches('/'), lot),
        })
    }

    pub fn without_summary(mut self) -> Self {
        self.summary = None;
        self
    }

    /// Inclusion of `payload_hash` under `merkle_root`.
    pub fn verify_inclusion(&self) -> bool {
        merkle::verify_proof(&self.payload_hash, &self.proof, &self.merkle_root)
    }

    pub fn to_compact_json(&self) -> Result<String> {
        serde_json::to_string(self).ctx_encoding("serialize QR payload")
    }
}

// ---------------------------------------------------------------------------
// Verification pack
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationPackManifest {
    pub format: String,
    pub generated_at_utc: String,
    pub generator: String,
    pub receipt_count: usize,
    pub merkle_root: String,
    pub tail_hash: String,
    pub ok: bool,
    pub notes: Vec<String>,
}

/// Write `manifest.json`, `verification_report.json` and `receipts.json`
/// into `out_dir`.
pub fn write_verification_pack(
    out_dir: &Path,
    report: &VerificationReport,
    receipts: &[Receipt],
) -> Result<VerificationPackManifest> {
    std::fs::create_dir_all(out_dir)
        .map_err(|e| FishoilError::Report(format!("create out dir {}: {e}", out_dir.display())))?;

    let manifest = VerificationPackManifest {
        format: "fishoil verification-pack v1".to_string(),
        generated_at_utc: util::now_utc_rfc3339(),
        generator: util::version_string(),
        receipt_count: receipts.len(),
        merkle_root: report.merkle_root.clone(),
        tail_hash: report.tail_hash.clone(),
        ok: report.ok,
        notes: vec![
            "Recompute every payload_hash from receipts.json and compare merkle_root.".to_string(),
        ],
    };

    write_json(&out_dir.join("manifest.json"), &manifest)?;
    write_json(&out_dir.join("verification_report.json"), report)?;
    write_json(&out_dir.join("receipts.json"), &receipts)?;

    info!(
        out_dir = %out_dir.display(),
        receipts = receipts.len(),
        ok = report.ok,
        "verification pack written"
    );
    Ok(manifest)
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_vec_pretty(value)
        .ctx_report(&format!("serialize {}", path.display()))?;
    std::fs::write(path, json).ctx_report(&format!("write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash;

    fn lot_receipts() -> (LotId, Vec<Receipt>) {
        let lot = LotId::new("LOT-Q").unwrap();
        let fields = Fields::new().with(FieldId::SPECIES, &"Gadus morhua").unwrap();
        let mut r = Receipt::new(Stage::Catch, lot.clone(), fields, hash::genesis_hash(), util::now_utc()).unwrap();
        r.sequence_number = 1;
        (lot, vec![r])
    }

    #[test]
    fn summary_uses_common_name() {
        let (lot, receipts) = lot_receipts();
        let s = LotSummary::from_receipts(&receipts, &lot, &FraudThresholds::default());
        assert_eq!(s.species.as_deref(), Some("Atlantic Cod"));
        assert_eq!(s.fishery_cert, "None");
        assert!(!s.fishery_certified);
        assert_eq!(s.cold_chain_verified, None);
        assert_eq!(s.oxidation_pass, None);
        assert_eq!(s.lot_number, None);
        assert_eq!(s.chain_length, 1);
    }

    #[test]
    fn oxidation_pass_checks_each_marker() {
        let lot = LotId::new("LOT-OX").unwrap();
        let pass = |peroxide_meq_per_kg: f64, anisidine: f64| {
            let fields = Fields::new()
                .with(FieldId::OXIDATION, &Oxidation { peroxide_meq_per_kg, anisidine })
                .unwrap();
            let r = Receipt::new(Stage::Testing, lot.clone(), fields, hash::genesis_hash(), util::now_utc()).unwrap();
            LotSummary::from_receipts(&[r], &lot, &FraudThresholds::default()).oxidation_pass
        };
        assert_eq!(pass(5.0, 16.0), Some(true));
        // TOTOX 14 is fine, but peroxide alone is over its limit.
        assert_eq!(pass(5.5, 3.0), Some(false));
        assert_eq!(pass(1.0, 20.5), Some(false));
        // Each marker within limit, TOTOX 28 over.
        assert_eq!(pass(4.5, 19.0), Some(false));
    }

    #[test]
    fn qr_payload_for_incomplete_lot_is_invalid_but_provable() {
        let (lot, receipts) = lot_receipts();
        let qr = QrPayload::for_lot(&receipts, &lot, "https://example.test/", &FraudThresholds::default()).unwrap();
        assert!(!qr.valid);
        assert_eq!(qr.verification_url, "https://example.test/LOT-Q");
        assert!(qr.verify_inclusion());
        let full = qr.to_compact_json().unwrap();
        assert!(!full.contains('\n'));
        assert!(qr.clone().without_summary().to_compact_json().unwrap().len() < full.len());
    }

    #[test]
    fn qr_payload_requires_receipts() {
        let (_, receipts) = lot_receipts();
        let err = QrPayload::for_lot(&receipts, &LotId::new("NOPE").unwrap(), DEFAULT_VERIFY_BASE_URL, &FraudThresholds::default())
            .unwrap_err();
        assert!(matches!(err, FishoilError::Report(_)));
    }

    #[test]
    fn pack_writes_three_files() {
        let (_, receipts) = lot_receipts();
        let dir = tempfile::tempdir().unwrap();
        let report = ChainVerifier::verify(&receipts, None);
        let manifest = write_verification_pack(dir.path(), &report, &receipts).unwrap();
        assert_eq!(manifest.receipt_count, 1);
        for f in ["manifest.json", "verification_report.json", "receipts.json"] {
            assert!(dir.path().join(f).exists(), "{f}");
        }
        let back: Vec<Receipt> =
            serde_json::from_slice(&std::fs::read(dir.path().join("receipts.json")).unwrap()).unwrap();
        assert_eq!(back, receipts);
    }
}
