//! FraudEngine: deterministic rule evaluation over stage field values.
//!
//! Every rule in [`RULES`] runs on every receipt; the resulting findings are
//! all kept, and the receipt's verdict is the maximum severity among them.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::fields::{
    ColdChain, Contaminants, FieldId, Fields, FisheryCertification, FisheryRecord, ImportDocs,
    Oxidation, Potency, YieldRecord,
};
use crate::receipt::Stage;

// ---------------------------------------------------------------------------
// Severity lattice
// ---------------------------------------------------------------------------

/// `Ok < Flag < Reject < Halt`. Comparison is the derived `Ord`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Ok,
    Flag,
    Reject,
    Halt,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Ok => "OK",
            Severity::Flag => "FLAG",
            Severity::Reject => "REJECT",
            Severity::Halt => "HALT",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleKind {
    Dilution,
    LowYield,
    LabelFraud,
    OxidationRisk,
    StorageWarning,
    Species,
    DocMismatch,
    CertGap,
    Contaminant,
    Rancid,
    Integrity,
}

impl RuleKind {
    /// Each kind has exactly one severity.
    pub fn severity(self) -> Severity {
        match self {
            RuleKind::Dilution
            | RuleKind::LowYield
            | RuleKind::OxidationRisk
            | RuleKind::StorageWarning
            | RuleKind::CertGap => Severity::Flag,
            RuleKind::LabelFraud
            | RuleKind::Species
            | RuleKind::DocMismatch
            | RuleKind::Contaminant
            | RuleKind::Rancid => Severity::Reject,
            RuleKind::Integrity => Severity::Halt,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RuleKind::Dilution => "DILUTION",
            RuleKind::LowYield => "LOW_YIELD",
            RuleKind::LabelFraud => "LABEL_FRAUD",
            RuleKind::OxidationRisk => "OXIDATION_RISK",
            RuleKind::StorageWarning => "STORAGE_WARNING",
            RuleKind::Species => "SPECIES",
            RuleKind::DocMismatch => "DOC_MISMATCH",
            RuleKind::CertGap => "CERT_GAP",
            RuleKind::Contaminant => "CONTAMINANT",
            RuleKind::Rancid => "RANCID",
            RuleKind::Integrity => "INTEGRITY",
        }
    }

    /// `<KIND>_<SEVERITY>`, e.g. `DILUTION_FLAG`.
    pub fn flag_id(self) -> String {
        format!("{}_{}", self.as_str(), self.severity().as_str())
    }
}

impl fmt::Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolved outcome for one receipt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "severity", content = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Ok,
    Flag(RuleKind),
    Reject(RuleKind),
    Halt(RuleKind),
}

impl Verdict {
    pub fn severity(self) -> Severity {
        match self {
            Verdict::Ok => Severity::Ok,
            Verdict::Flag(_) => Severity::Flag,
            Verdict::Reject(_) => Severity::Reject,
            Verdict::Halt(_) => Severity::Halt,
        }
    }

    pub fn kind(self) -> Option<RuleKind> {
        match self {
            Verdict::Ok => None,
            Verdict::Flag(k) | Verdict::Reject(k) | Verdict::Halt(k) => Some(k),
        }
    }

    fn of(kind: RuleKind) -> Self {
        match kind.severity() {
            Severity::Ok => Verdict::Ok,
            Severity::Flag => Verdict::Flag(kind),
            Severity::Reject => Verdict::Reject(kind),
            Severity::Halt => Verdict::Halt(kind),
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            None => f.write_str("OK"),
            Some(k) => write!(f, "{} {}", self.severity(), k),
        }
    }
}

// ---------------------------------------------------------------------------
// Findings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub kind: RuleKind,
    pub detail: String,
}

impl Finding {
    fn new(kind: RuleKind, detail: impl Into<String>) -> Self {
        Self { kind, detail: detail.into() }
    }

    pub fn severity(&self) -> Severity {
        self.kind.severity()
    }

    pub fn flag_id(&self) -> String {
        self.kind.flag_id()
    }
}

/// All findings raised for one receipt, in rule-table order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Assessment {
    pub findings: Vec<Finding>,
}

impl Assessment {
    /// Maximum severity across all findings. Ties resolve to the first
    /// finding in rule-table order.
    pub fn verdict(&self) -> Verdict {
        let mut best: Option<&Finding> = None;
        for f in &self.findings {
            if best.map_or(true, |b| f.severity() > b.severity()) {
                best = Some(f);
            }
        }
        best.map_or(Verdict::Ok, |f| Verdict::of(f.kind))
    }

    pub fn severity(&self) -> Severity {
        self.verdict().severity()
    }

    /// Findings at FLAG severity (the ones that ride along with an accepted
    /// receipt as AnomalyReceipts).
    pub fn flags(&self) -> impl Iterator<Item = &Finding> {
        self.findings.iter().filter(|f| f.severity() == Severity::Flag)
    }

    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Thresholds
// ---------------------------------------------------------------------------

/// FDA-listed fish-oil source species (scientific name, common name).
pub const APPROVED_SPECIES: [(&str, &str); 15] = [
    ("Engraulis ringens", "Peruvian Anchoveta"),
    ("Sardina pilchardus", "European Sardine"),
    ("Brevoortia tyrannus", "Atlantic Menhaden"),
    ("Brevoortia patronus", "Gulf Menhaden"),
    ("Clupea harengus", "Atlantic Herring"),
    ("Scomber scombrus", "Atlantic Mackerel"),
    ("Mallotus villosus", "Capelin"),
    ("Salmo salar", "Atlantic Salmon"),
    ("Oncorhynchus mykiss", "Rainbow Trout"),
    ("Gadus morhua", "Atlantic Cod"),
    ("Pollachius virens", "Pollock"),
    ("Thunnus albacares", "Yellowfin Tuna"),
    ("Katsuwonus pelamis", "Skipjack Tuna"),
    ("Sprattus sprattus", "European Sprat"),
    ("Micromesistius poutassou", "Blue Whiting"),
];

pub fn common_name(scientific: &str) -> Option<&'static str> {
    APPROVED_SPECIES
        .iter()
        .find(|(s, _)| *s == scientific)
        .map(|(_, c)| *c)
}

/// Rule thresholds. All comparisons are strict (`>` / `<`): a value sitting
/// exactly on a threshold does not fire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FraudThresholds {
    pub yield_max_ratio: f64,
    pub yield_min_ratio: f64,
    pub potency_min_ratio: f64,
    pub cold_chain_max_temp_c: f64,
    pub cold_chain_max_deviations: u32,
    pub totox_max: f64,
    /// Per-marker oxidation limits; reported in the lot summary only.
    pub peroxide_max_meq_per_kg: f64,
    pub anisidine_max: f64,
    pub mercury_max_ppm: f64,
    pub pcbs_max_ppm: f64,
    pub dioxins_max_pg_per_g: f64,
    pub approved_species: Vec<String>,
}

impl Default for FraudThresholds {
    fn default() -> Self {
        Self {
            yield_max_ratio: 0.18,
            yield_min_ratio: 0.12,
            potency_min_ratio: 0.95,
            cold_chain_max_temp_c: 8.0,
            cold_chain_max_deviations: 3,
            totox_max: 26.0,
            peroxide_max_meq_per_kg: 5.0,
            anisidine_max: 20.0,
            mercury_max_ppm: 0.1,
            pcbs_max_ppm: 0.09,
            dioxins_max_pg_per_g: 3.0,
            approved_species: APPROVED_SPECIES.iter().map(|(s, _)| (*s).to_string()).collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Inputs to one evaluation.
#[derive(Debug, Clone, Copy)]
pub struct RuleContext<'a> {
    pub stage: Stage,
    /// The current stage's fields.
    pub fields: &'a Fields,
    /// Tracked fields carried forward from this lot's earlier receipts.
    pub carried: &'a Fields,
    /// `false` when the receipt being chained onto fails hash recomputation.
    pub chain_intact: bool,
}

pub type Rule = fn(&FraudThresholds, &RuleContext<'_>) -> Option<Finding>;

/// The fixed, ordered rule table.
pub const RULES: [(RuleKind, Rule); 11] = [
    (RuleKind::Dilution, dilution),
    (RuleKind::LowYield, low_yield),
    (RuleKind::LabelFraud, label_fraud),
    (RuleKind::OxidationRisk, oxidation_risk),
    (RuleKind::StorageWarning, storage_warning),
    (RuleKind::Species, species),
    (RuleKind::DocMismatch, doc_mismatch),
    (RuleKind::CertGap, cert_gap),
    (RuleKind::Contaminant, contaminant),
    (RuleKind::Rancid, rancid),
    (RuleKind::Integrity, integrity),
];

#[derive(Debug, Clone, Default)]
pub struct FraudEngine {
    thresholds: FraudThresholds,
}

impl FraudEngine {
    pub fn new(thresholds: FraudThresholds) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> &FraudThresholds {
        &self.thresholds
    }

    /// Run every rule; no short-circuit on the first match.
    pub fn evaluate(&self, ctx: &RuleContext<'_>) -> Assessment {
        let findings = RULES
            .iter()
            .filter_map(|(kind, rule)| {
                let finding = rule(&self.thresholds, ctx)?;
                debug_assert_eq!(finding.kind, *kind);
                Some(finding)
            })
            .collect();
        Assessment { findings }
    }

    /// Yield ratio for a processing field set, using the carried catch
    /// weight when the yield record has no explicit input mass.
    pub fn yield_ratio(fields: &Fields, carried: &Fields) -> Option<f64> {
        let y: YieldRecord = decode(fields, FieldId::YIELD)?;
        let input = match y.input_kg {
            Some(i) => i,
            None => decode::<FisheryRecord>(carried, FieldId::FISHERY)?.catch_weight_kg,
        };
        (input > 0.0).then(|| y.output_kg / input)
    }
}

// Fields have already passed schema validation; anything that still fails to
// decode is treated as absent.
fn decode<T: serde::de::DeserializeOwned>(fields: &Fields, id: FieldId) -> Option<T> {
    fields.record(id).ok().flatten()
}

fn pct(r: f64) -> String {
    format!("{:.2}%", r * 100.0)
}

fn dilution(t: &FraudThresholds, ctx: &RuleContext<'_>) -> Option<Finding> {
    let ratio = FraudEngine::yield_ratio(ctx.fields, ctx.carried)?;
    (ratio > t.yield_max_ratio).then(|| {
        Finding::new(
            RuleKind::Dilution,
            format!(
                "yield {} exceeds expected max {}; possible dilution with cheaper oils",
                pct(ratio),
                pct(t.yield_max_ratio)
            ),
        )
    })
}

fn low_yield(t: &FraudThresholds, ctx: &RuleContext<'_>) -> Option<Finding> {
    let ratio = FraudEngine::yield_ratio(ctx.fields, ctx.carried)?;
    (ratio < t.yield_min_ratio).then(|| {
        Finding::new(
            RuleKind::LowYield,
            format!("yield {} below expected min {}", pct(ratio), pct(t.yield_min_ratio)),
        )
    })
}

fn label_fraud(t: &FraudThresholds, ctx: &RuleContext<'_>) -> Option<Finding> {
    let p: Potency = decode(ctx.fields, FieldId::POTENCY)?;
    let ratio = p.total_omega3_mg() / p.label_claim_mg;
    (ratio < t.potency_min_ratio).then(|| {
        Finding::new(
            RuleKind::LabelFraud,
            format!(
                "EPA+DHA {:.0}mg is {} of label claim {:.0}mg (minimum {})",
                p.total_omega3_mg(),
                pct(ratio),
                p.label_claim_mg,
                pct(t.potency_min_ratio)
            ),
        )
    })
}

fn cold_chain(ctx: &RuleContext<'_>) -> Option<ColdChain> {
    decode(ctx.fields, FieldId::COLD_CHAIN)
}

fn oxidation_risk(t: &FraudThresholds, ctx: &RuleContext<'_>) -> Option<Finding> {
    let cc = cold_chain(ctx)?;
    (cc.max_temp_c > t.cold_chain_max_temp_c).then(|| {
        Finding::new(
            RuleKind::OxidationRisk,
            format!(
                "max temperature {}°C exceeds {}°C",
                cc.max_temp_c, t.cold_chain_max_temp_c
            ),
        )
    })
}

fn storage_warning(t: &FraudThresholds, ctx: &RuleContext<'_>) -> Option<Finding> {
    let cc = cold_chain(ctx)?;
    (cc.deviation_count > t.cold_chain_max_deviations).then(|| {
        Finding::new(
            RuleKind::StorageWarning,
            format!(
                "{} temperature deviations exceed limit of {}",
                cc.deviation_count, t.cold_chain_max_deviations
            ),
        )
    })
}

fn species(t: &FraudThresholds, ctx: &RuleContext<'_>) -> Option<Finding> {
    let name: String = decode(ctx.fields, FieldId::SPECIES)?;
    (!t.approved_species.iter().any(|s| *s == name)).then(|| {
        Finding::new(RuleKind::Species, format!("species '{name}' is not on the approved list"))
    })
}

fn doc_mismatch(_: &FraudThresholds, ctx: &RuleContext<'_>) -> Option<Finding> {
    let docs: ImportDocs = decode(ctx.fields, FieldId::IMPORT_DOCS)?;
    let registry = docs.registry_hash?;
    (registry != docs.hash).then(|| {
        Finding::new(
            RuleKind::DocMismatch,
            "import document hash does not match the registry copy",
        )
    })
}

fn cert_gap(_: &FraudThresholds, ctx: &RuleContext<'_>) -> Option<Finding> {
    let cert: FisheryCertification = decode(ctx.fields, FieldId::FISHERY_CERTIFICATION)?;
    (cert.is_claimed() && cert.cert_hash.is_none()).then(|| {
        Finding::new(
            RuleKind::CertGap,
            format!("fishery certification {:?} claimed without a certificate hash", cert.scheme),
        )
    })
}

fn contaminant(t: &FraudThresholds, ctx: &RuleContext<'_>) -> Option<Finding> {
    let c: Contaminants = decode(ctx.fields, FieldId::CONTAMINANTS)?;
    let failed: Vec<String> = [
        ("mercury_ppm", c.mercury_ppm, t.mercury_max_ppm),
        ("pcbs_ppm", c.pcbs_ppm, t.pcbs_max_ppm),
        ("dioxins_pg_per_g", c.dioxins_pg_per_g, t.dioxins_max_pg_per_g),
    ]
    .into_iter()
    .filter(|(_, v, max)| v > max)
    .map(|(name, v, max)| format!("{name} {v} > {max}"))
    .collect();
    (!failed.is_empty()).then(|| Finding::new(RuleKind::Contaminant, failed.join(", ")))
}

fn rancid(t: &FraudThresholds, ctx: &RuleContext<'_>) -> Option<Finding> {
    let o: Oxidation = decode(ctx.fields, FieldId::OXIDATION)?;
    let totox = o.totox();
    (totox > t.totox_max)
        .then(|| Finding::new(RuleKind::Rancid, format!("TOTOX {totox} exceeds {}", t.totox_max)))
}

fn integrity(_: &FraudThresholds, ctx: &RuleContext<'_>) -> Option<Finding> {
    (!ctx.chain_intact).then(|| {
        Finding::new(
            RuleKind::Integrity,
            format!("previous receipt failed hash verification before {}", ctx.stage),
        )
    })
}
