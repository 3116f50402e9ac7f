//! FieldSchema: the static registry of the fifteen tracked fields.
//!
//! Validation fails closed. A receipt for a stage whose required fields are
//! absent, or whose present fields do not decode into their record shape,
//! is never constructed.

use std::collections::BTreeSet;

use time::Date;

use crate::error::ValidationError;
use crate::fields::{
    Certification, ColdChain, Contaminants, Custody, Extraction, Facility, FieldId, Fields,
    FisheryCertification, FisheryRecord, ImportDocs, Oxidation, Potency, YieldRecord,
};
use crate::hash;
use crate::receipt::Stage;
use crate::util;

pub const GMP_CERT_TYPES: [&str; 3] = ["NSF", "USP", "Other"];
pub const LAB_CERT_TYPES: [&str; 2] = ["ISO17025", "Other"];
pub const FACILITY_CERT_TYPES: [&str; 3] = ["NSF", "USP", "Other"];
pub const EXTRACTION_METHODS: [&str; 3] = ["MolecularDistillation", "Winterization", "SupercriticalCO2"];

/// Named attributes of an ENCAPSULATION receipt.
pub mod encapsulation_keys {
    pub const FACILITY_CERT_TYPE: &str = "facility_cert_type";
    pub const FACILITY_CERT_HASH: &str = "facility_cert_hash";
    pub const FILL_DATE: &str = "fill_date";
    /// Optional on input; the pipeline assigns one when absent.
    pub const LOT_NUMBER: &str = "lot_number";

    pub const REQUIRED: [&str; 3] = [FACILITY_CERT_TYPE, FACILITY_CERT_HASH, FILL_DATE];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub id: FieldId,
    pub name: &'static str,
    pub stage: Stage,
    pub required: bool,
}

const fn spec(id: FieldId, name: &'static str, stage: Stage, required: bool) -> FieldSpec {
    FieldSpec { id, name, stage, required }
}

/// Field number -> {name, owning stage, required}. Indexed by `id - 1`.
pub static REGISTRY: [FieldSpec; 15] = [
    spec(FieldId::SPECIES, "species", Stage::Catch, true),
    spec(FieldId::FISHERY, "fishery", Stage::Catch, true),
    spec(FieldId::IMPORT_DOCS, "import_docs", Stage::Catch, true),
    spec(FieldId::PROCESSING_FACILITY, "processing_facility", Stage::Processing, true),
    spec(FieldId::GMP_CERTIFICATION, "gmp_certification", Stage::Processing, true),
    spec(FieldId::EXTRACTION, "extraction", Stage::Processing, true),
    spec(FieldId::YIELD, "yield", Stage::Processing, true),
    spec(FieldId::LAB_CERTIFICATION, "lab_certification", Stage::Testing, true),
    spec(FieldId::CONTAMINANTS, "contaminants", Stage::Testing, true),
    spec(FieldId::POTENCY, "potency", Stage::Testing, true),
    spec(FieldId::OXIDATION, "oxidation", Stage::Testing, true),
    spec(FieldId::CUSTODY, "custody", Stage::Distribution, true),
    spec(FieldId::FISHERY_CERTIFICATION, "fishery_certification", Stage::Catch, true),
    spec(FieldId::BATCH_ID, "batch_id", Stage::Processing, true),
    spec(FieldId::COLD_CHAIN, "cold_chain", Stage::Distribution, false),
];

pub fn field_spec(id: FieldId) -> &'static FieldSpec {
    &REGISTRY[usize::from(id.get() - 1)]
}

pub fn field_name(id: FieldId) -> &'static str {
    field_spec(id).name
}

/// Every field number owned by `stage`, required or not.
pub fn fields_for(stage: Stage) -> BTreeSet<FieldId> {
    REGISTRY.iter().filter(|s| s.stage == stage).map(|s| s.id).collect()
}

pub fn required_for(stage: Stage) -> BTreeSet<FieldId> {
    REGISTRY
        .iter()
        .filter(|s| s.stage == stage && s.required)
        .map(|s| s.id)
        .collect()
}

/// Check that `fields` is a complete, well-formed value set for `stage`.
///
/// Order of checks: missing required fields (all reported at once), then
/// numbered fields owned by another stage, then per-record shape.
/// ENCAPSULATION owns no numbered field; its facility attributes and fill
/// date are checked last. ANOMALY receipts are not validated here.
pub fn validate(stage: Stage, fields: &Fields) -> Result<(), ValidationError> {
    if stage == Stage::Anomaly {
        return Err(ValidationError::UnsupportedStage(stage));
    }

    let missing: Vec<FieldId> = required_for(stage)
        .into_iter()
        .filter(|id| !fields.contains(*id))
        .collect();
    if !missing.is_empty() {
        return Err(ValidationError::MissingFields(missing));
    }

    let owned = fields_for(stage);
    if let Some(field) = fields.tracked_ids().find(|id| !owned.contains(id)) {
        return Err(ValidationError::UnexpectedField { field, stage });
    }

    for id in fields.tracked_ids() {
        check_shape(id, fields)?;
    }
    if stage == Stage::Encapsulation {
        check_encapsulation(fields)?;
    }
    Ok(())
}

/// The ENCAPSULATION fill date as a calendar date.
pub fn fill_date(fields: &Fields) -> Result<Date, ValidationError> {
    let name = encapsulation_keys::FILL_DATE;
    let raw = attribute_str(fields, name)?;
    util::parse_iso8601_date(raw)
        .ok_or_else(|| malformed_attribute(name, format!("'{raw}' is not an ISO-8601 date")))
}

fn check_encapsulation(fields: &Fields) -> Result<(), ValidationError> {
    use encapsulation_keys::*;

    let missing: Vec<String> = REQUIRED
        .iter()
        .filter(|name| fields.get_named(name).is_none())
        .map(|name| name.to_string())
        .collect();
    if !missing.is_empty() {
        return Err(ValidationError::MissingAttributes(missing));
    }

    let cert_type = attribute_str(fields, FACILITY_CERT_TYPE)?;
    if !FACILITY_CERT_TYPES.contains(&cert_type) {
        return Err(malformed_attribute(
            FACILITY_CERT_TYPE,
            format!("'{cert_type}' not in {FACILITY_CERT_TYPES:?}"),
        ));
    }
    if !hash::is_dual_hash(attribute_str(fields, FACILITY_CERT_HASH)?) {
        return Err(malformed_attribute(FACILITY_CERT_HASH, "not a dual hash"));
    }
    fill_date(fields)?;

    if fields.get_named(LOT_NUMBER).is_some() && attribute_str(fields, LOT_NUMBER)?.trim().is_empty() {
        return Err(malformed_attribute(LOT_NUMBER, "is empty"));
    }
    Ok(())
}

fn attribute_str<'a>(fields: &'a Fields, name: &str) -> Result<&'a str, ValidationError> {
    match fields.get_named(name) {
        None => Err(ValidationError::MissingAttributes(vec![name.to_string()])),
        Some(v) => v.as_str().ok_or_else(|| malformed_attribute(name, "must be a string")),
    }
}

fn malformed_attribute(name: &str, reason: impl Into<String>) -> ValidationError {
    ValidationError::MalformedAttribute { name: name.to_string(), reason: reason.into() }
}

fn malformed(field: FieldId, reason: impl Into<String>) -> ValidationError {
    ValidationError::Malformed { field, reason: reason.into() }
}

fn positive(field: FieldId, label: &str, v: f64) -> Result<(), ValidationError> {
    if !v.is_finite() || v <= 0.0 {
        return Err(malformed(field, format!("{label} must be a positive number, got {v}")));
    }
    Ok(())
}

fn non_negative(field: FieldId, label: &str, v: f64) -> Result<(), ValidationError> {
    if !v.is_finite() || v < 0.0 {
        return Err(malformed(field, format!("{label} must be >= 0, got {v}")));
    }
    Ok(())
}

fn dual(field: FieldId, label: &str, h: &str) -> Result<(), ValidationError> {
    if !hash::is_dual_hash(h) {
        return Err(malformed(field, format!("{label} is not a dual hash")));
    }
    Ok(())
}

fn non_empty(field: FieldId, label: &str, s: &str) -> Result<(), ValidationError> {
    if s.trim().is_empty() {
        return Err(malformed(field, format!("{label} is empty")));
    }
    Ok(())
}

fn required<T: serde::de::DeserializeOwned>(id: FieldId, fields: &Fields) -> Result<T, ValidationError> {
    fields
        .record::<T>(id)?
        .ok_or_else(|| ValidationError::MissingFields(vec![id]))
}

fn one_of(field: FieldId, label: &str, value: &str, allowed: &[&str]) -> Result<(), ValidationError> {
    if !allowed.contains(&value) {
        return Err(malformed(field, format!("{label} '{value}' not in {allowed:?}")));
    }
    Ok(())
}

fn check_cert(id: FieldId, c: &Certification, cert_types: &[&str]) -> Result<(), ValidationError> {
    non_empty(id, "holder", &c.holder)?;
    one_of(id, "cert_type", &c.cert_type, cert_types)?;
    non_empty(id, "cert_id", &c.cert_id)?;
    dual(id, "cert_hash", &c.cert_hash)
}

fn check_shape(id: FieldId, fields: &Fields) -> Result<(), ValidationError> {
    match id {
        FieldId::SPECIES => {
            let s: String = required(id, fields)?;
            non_empty(id, "species", &s)
        }
        FieldId::FISHERY => {
            let f: FisheryRecord = required(id, fields)?;
            non_empty(id, "registry", &f.registry)?;
            positive(id, "catch_weight_kg", f.catch_weight_kg)
        }
        FieldId::IMPORT_DOCS => {
            let d: ImportDocs = required(id, fields)?;
            dual(id, "hash", &d.hash)?;
            match &d.registry_hash {
                Some(r) => dual(id, "registry_hash", r),
                None => Ok(()),
            }
        }
        FieldId::PROCESSING_FACILITY => {
            let f: Facility = required(id, fields)?;
            non_empty(id, "id", &f.id)
        }
        FieldId::GMP_CERTIFICATION => {
            let c: Certification = required(id, fields)?;
            check_cert(id, &c, &GMP_CERT_TYPES)
        }
        FieldId::LAB_CERTIFICATION => {
            let c: Certification = required(id, fields)?;
            check_cert(id, &c, &LAB_CERT_TYPES)
        }
        FieldId::EXTRACTION => {
            let e: Extraction = required(id, fields)?;
            one_of(id, "method", &e.method, &EXTRACTION_METHODS)?;
            if !e.temp_c.is_finite() {
                return Err(malformed(id, "temp_c is not finite"));
            }
            Ok(())
        }
        FieldId::YIELD => {
            let y: YieldRecord = required(id, fields)?;
            positive(id, "output_kg", y.output_kg)?;
            match y.input_kg {
                Some(i) => positive(id, "input_kg", i),
                None => Ok(()),
            }
        }
        FieldId::CONTAMINANTS => {
            let c: Contaminants = required(id, fields)?;
            non_negative(id, "mercury_ppm", c.mercury_ppm)?;
            non_negative(id, "pcbs_ppm", c.pcbs_ppm)?;
            non_negative(id, "dioxins_pg_per_g", c.dioxins_pg_per_g)
        }
        FieldId::POTENCY => {
            let p: Potency = required(id, fields)?;
            non_negative(id, "epa_mg", p.epa_mg)?;
            non_negative(id, "dha_mg", p.dha_mg)?;
            positive(id, "label_claim_mg", p.label_claim_mg)
        }
        FieldId::OXIDATION => {
            let o: Oxidation = required(id, fields)?;
            non_negative(id, "peroxide_meq_per_kg", o.peroxide_meq_per_kg)?;
            non_negative(id, "anisidine", o.anisidine)
        }
        FieldId::CUSTODY => {
            let c: Custody = required(id, fields)?;
            non_empty(id, "distributor_id", &c.distributor_id)?;
            non_empty(id, "warehouse_id", &c.warehouse_id)
        }
        FieldId::FISHERY_CERTIFICATION => {
            let c: FisheryCertification = required(id, fields)?;
            match &c.cert_hash {
                Some(h) => dual(id, "cert_hash", h),
                None => Ok(()),
            }
        }
        FieldId::BATCH_ID => {
            let b: String = required(id, fields)?;
            non_empty(id, "batch_id", &b)
        }
        FieldId::COLD_CHAIN => {
            let c: ColdChain = required(id, fields)?;
            for (label, v) in [
                ("max_temp_c", c.max_temp_c),
                ("min_temp_c", c.min_temp_c),
                ("avg_temp_c", c.avg_temp_c),
            ] {
                if !v.is_finite() {
                    return Err(malformed(id, format!("{label} is not finite")));
                }
            }
            if c.min_temp_c > c.max_temp_c {
                return Err(malformed(id, "min_temp_c exceeds max_temp_c"));
            }
            match &c.temp_log_hash {
                Some(h) => dual(id, "temp_log_hash", h),
                None => Ok(()),
            }
        }
        _ => Err(malformed(id, "unknown field")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::CertScheme;
    use crate::hash::dual_hash;

    fn catch_fields() -> Fields {
        Fields::new()
            .with(FieldId::SPECIES, &"Engraulis ringens")
            .unwrap()
            .with(
                FieldId::FISHERY,
                &FisheryRecord { registry: "PE-IMARPE-0042".into(), catch_weight_kg: 1000.0 },
            )
            .unwrap()
            .with(FieldId::IMPORT_DOCS, &ImportDocs { hash: dual_hash(b"bill-of-lading"), registry_hash: None })
            .unwrap()
            .with(
                FieldId::FISHERY_CERTIFICATION,
                &FisheryCertification { scheme: CertScheme::Msc, cert_id: Some("MSC-F-1".into()), cert_hash: Some(dual_hash(b"msc")) },
            )
            .unwrap()
    }

    #[test]
    fn registry_is_indexed_by_number() {
        for id in FieldId::all() {
            assert_eq!(field_spec(id).id, id);
        }
        assert_eq!(field_name(FieldId::COLD_CHAIN), "cold_chain");
    }

    #[test]
    fn stage_ownership() {
        let catch: Vec<u8> = fields_for(Stage::Catch).into_iter().map(FieldId::get).collect();
        assert_eq!(catch, vec![1, 2, 3, 13]);
        let processing: Vec<u8> = fields_for(Stage::Processing).into_iter().map(FieldId::get).collect();
        assert_eq!(processing, vec![4, 5, 6, 7, 14]);
        assert!(fields_for(Stage::Encapsulation).is_empty());
        assert!(fields_for(Stage::Distribution).contains(&FieldId::COLD_CHAIN));
        assert!(!required_for(Stage::Distribution).contains(&FieldId::COLD_CHAIN));
    }

    #[test]
    fn complete_catch_validates() {
        assert_eq!(validate(Stage::Catch, &catch_fields()), Ok(()));
    }

    #[test]
    fn missing_fields_are_listed_together() {
        let fields = Fields::new().with(FieldId::FISHERY, &FisheryRecord { registry: "r".into(), catch_weight_kg: 1.0 }).unwrap();
        assert_eq!(
            validate(Stage::Catch, &fields),
            Err(ValidationError::MissingFields(vec![
                FieldId::SPECIES,
                FieldId::IMPORT_DOCS,
                FieldId::FISHERY_CERTIFICATION
            ]))
        );
    }

    #[test]
    fn foreign_field_rejected() {
        let fields = catch_fields().with(FieldId::BATCH_ID, &"B-1").unwrap();
        assert_eq!(
            validate(Stage::Catch, &fields),
            Err(ValidationError::UnexpectedField { field: FieldId::BATCH_ID, stage: Stage::Catch })
        );
    }

    fn encapsulation_fields() -> Fields {
        Fields::new()
            .with_named(encapsulation_keys::FACILITY_CERT_TYPE, &"NSF")
            .unwrap()
            .with_named(encapsulation_keys::FACILITY_CERT_HASH, &dual_hash(b"nsf-cert"))
            .unwrap()
            .with_named(encapsulation_keys::FILL_DATE, &"2025-02-03")
            .unwrap()
            .with_named("capsule_count", &120)
            .unwrap()
    }

    fn processing_fields(cert_type: &str, method: &str) -> Fields {
        Fields::new()
            .with(FieldId::PROCESSING_FACILITY, &Facility { id: "FAC-1".into(), name: "Refinery".into() })
            .unwrap()
            .with(
                FieldId::GMP_CERTIFICATION,
                &Certification {
                    holder: "Refinery".into(),
                    cert_type: cert_type.into(),
                    cert_id: "GMP-1".into(),
                    cert_hash: dual_hash(b"gmp"),
                },
            )
            .unwrap()
            .with(FieldId::EXTRACTION, &Extraction { method: method.into(), temp_c: 180.0 })
            .unwrap()
            .with(FieldId::YIELD, &YieldRecord { output_kg: 150.0, input_kg: None })
            .unwrap()
            .with(FieldId::BATCH_ID, &"B-1")
            .unwrap()
    }

    #[test]
    fn encapsulation_takes_named_attributes() {
        assert_eq!(validate(Stage::Encapsulation, &encapsulation_fields()), Ok(()));
        assert_eq!(fill_date(&encapsulation_fields()), Ok(time::macros::date!(2025 - 02 - 03)));
    }

    #[test]
    fn encapsulation_lists_missing_attributes() {
        let fields = Fields::new().with_named("capsule_count", &120).unwrap();
        assert_eq!(
            validate(Stage::Encapsulation, &fields),
            Err(ValidationError::MissingAttributes(vec![
                "facility_cert_type".into(),
                "facility_cert_hash".into(),
                "fill_date".into()
            ]))
        );
    }

    #[test]
    fn encapsulation_attribute_values_are_checked() {
        let cases = [
            (encapsulation_keys::FACILITY_CERT_TYPE, serde_json::json!("GMP")),
            (encapsulation_keys::FACILITY_CERT_HASH, serde_json::json!("sha256:abc")),
            (encapsulation_keys::FILL_DATE, serde_json::json!("03/02/2025")),
            (encapsulation_keys::FILL_DATE, serde_json::json!(20250203)),
            (encapsulation_keys::LOT_NUMBER, serde_json::json!("  ")),
        ];
        for (name, value) in cases {
            let fields = encapsulation_fields().with_named(name, &value).unwrap();
            assert!(
                matches!(
                    validate(Stage::Encapsulation, &fields),
                    Err(ValidationError::MalformedAttribute { name: ref n, .. }) if n == name
                ),
                "{name} = {value}"
            );
        }
    }

    #[test]
    fn processing_cert_type_and_method_are_closed_sets() {
        assert_eq!(validate(Stage::Processing, &processing_fields("USP", "Winterization")), Ok(()));
        assert_eq!(validate(Stage::Processing, &processing_fields("Other", "SupercriticalCO2")), Ok(()));

        for (cert_type, method, field) in [
            ("GMP", "MolecularDistillation", FieldId::GMP_CERTIFICATION),
            ("ISO17025", "MolecularDistillation", FieldId::GMP_CERTIFICATION),
            ("NSF", "molecular distillation", FieldId::EXTRACTION),
            ("NSF", "", FieldId::EXTRACTION),
        ] {
            assert!(
                matches!(
                    validate(Stage::Processing, &processing_fields(cert_type, method)),
                    Err(ValidationError::Malformed { field: f, .. }) if f == field
                ),
                "{cert_type}/{method}"
            );
        }
    }

    #[test]
    fn lab_cert_type_is_closed_set() {
        let cert = |cert_type: &str| Certification {
            holder: "Eurofins".into(),
            cert_type: cert_type.into(),
            cert_id: "L-1".into(),
            cert_hash: dual_hash(b"lab"),
        };
        let mut fields = Fields::new()
            .with(FieldId::LAB_CERTIFICATION, &cert("NSF"))
            .unwrap()
            .with(FieldId::CONTAMINANTS, &Contaminants { mercury_ppm: 0.0, pcbs_ppm: 0.0, dioxins_pg_per_g: 0.0 })
            .unwrap()
            .with(FieldId::POTENCY, &Potency { epa_mg: 400.0, dha_mg: 300.0, label_claim_mg: 700.0 })
            .unwrap()
            .with(FieldId::OXIDATION, &Oxidation { peroxide_meq_per_kg: 1.0, anisidine: 5.0 })
            .unwrap();
        assert!(matches!(
            validate(Stage::Testing, &fields),
            Err(ValidationError::Malformed { field: FieldId::LAB_CERTIFICATION, .. })
        ));
        fields.set(FieldId::LAB_CERTIFICATION, &cert("ISO17025")).unwrap();
        assert_eq!(validate(Stage::Testing, &fields), Ok(()));
    }

    #[test]
    fn bad_hash_is_malformed() {
        let mut fields = catch_fields();
        fields
            .set(FieldId::IMPORT_DOCS, &ImportDocs { hash: "sha256:nope".into(), registry_hash: None })
            .unwrap();
        assert!(matches!(
            validate(Stage::Catch, &fields),
            Err(ValidationError::Malformed { field, .. }) if field == FieldId::IMPORT_DOCS
        ));
    }

    #[test]
    fn zero_weight_is_malformed() {
        let mut fields = catch_fields();
        fields.set(FieldId::FISHERY, &FisheryRecord { registry: "r".into(), catch_weight_kg: 0.0 }).unwrap();
        assert!(validate(Stage::Catch, &fields).is_err());
    }

    #[test]
    fn anomaly_stage_unsupported() {
        assert_eq!(
            validate(Stage::Anomaly, &Fields::new()),
            Err(ValidationError::UnsupportedStage(Stage::Anomaly))
        );
    }
}
