//! Shared builders for integration tests. Every builder produces fields
//! that pass schema validation and trip no fraud rule.

#![allow(dead_code)]

use anyhow::Result;

use fishoil_core::fields::{
    CertScheme, Certification, ColdChain, Contaminants, Custody, Extraction, Facility, FieldId,
    Fields, FisheryCertification, FisheryRecord, ImportDocs, Oxidation, Potency, YieldRecord,
};
use fishoil_core::hash::dual_hash;
use fishoil_core::receipt::{LotId, Stage};

pub fn lot(s: &str) -> LotId {
    LotId::new(s).expect("valid lot id")
}

pub fn catch_fields(catch_weight_kg: f64) -> Result<Fields> {
    let doc = dual_hash(b"bill-of-lading-7781");
    Ok(Fields::new()
        .with(FieldId::SPECIES, &"Engraulis ringens")?
        .with(
            FieldId::FISHERY,
            &FisheryRecord { registry: "PE-IMARPE-0042".into(), catch_weight_kg },
        )?
        .with(FieldId::IMPORT_DOCS, &ImportDocs { hash: doc.clone(), registry_hash: Some(doc) })?
        .with(
            FieldId::FISHERY_CERTIFICATION,
            &FisheryCertification {
                scheme: CertScheme::Msc,
                cert_id: Some("MSC-C-52011".into()),
                cert_hash: Some(dual_hash(b"msc-c-52011")),
            },
        )?)
}

pub fn processing_fields(output_kg: f64) -> Result<Fields> {
    Ok(Fields::new()
        .with(FieldId::PROCESSING_FACILITY, &Facility { id: "FAC-LIMA-1".into(), name: "Lima Refinery".into() })?
        .with(
            FieldId::GMP_CERTIFICATION,
            &Certification {
                holder: "Lima Refinery".into(),
                cert_type: "NSF".into(),
                cert_id: "GMP-2025-118".into(),
                cert_hash: dual_hash(b"gmp-2025-118"),
            },
        )?
        .with(FieldId::EXTRACTION, &Extraction { method: "MolecularDistillation".into(), temp_c: 180.0 })?
        .with(FieldId::YIELD, &YieldRecord { output_kg, input_kg: None })?
        .with(FieldId::BATCH_ID, &"B-0131")?)
}

pub fn testing_fields(epa_mg: f64, dha_mg: f64, label_claim_mg: f64) -> Result<Fields> {
    Ok(Fields::new()
        .with(
            FieldId::LAB_CERTIFICATION,
            &Certification {
                holder: "Eurofins".into(),
                cert_type: "ISO17025".into(),
                cert_id: "ISO-17025-889".into(),
                cert_hash: dual_hash(b"iso-17025-889"),
            },
        )?
        .with(
            FieldId::CONTAMINANTS,
            &Contaminants { mercury_ppm: 0.02, pcbs_ppm: 0.01, dioxins_pg_per_g: 0.4 },
        )?
        .with(FieldId::POTENCY, &Potency { epa_mg, dha_mg, label_claim_mg })?
        .with(FieldId::OXIDATION, &Oxidation { peroxide_meq_per_kg: 3.0, anisidine: 10.0 })?)
}

/// ENCAPSULATION without a lot number; the pipeline assigns one from the
/// batch id and fill date.
pub fn encapsulation_fields() -> Result<Fields> {
    Ok(Fields::new()
        .with_named("facility_cert_type", &"NSF")?
        .with_named("facility_cert_hash", &dual_hash(b"nsf-encap-311"))?
        .with_named("fill_date", &"2025-02-03")?
        .with_named("capsule_count", &120)?
        .with_named("mg_per_capsule", &1000)?)
}

pub fn encapsulation_fields_numbered(lot_number: &str) -> Result<Fields> {
    Ok(encapsulation_fields()?.with_named("lot_number", &lot_number)?)
}

pub fn distribution_fields(readings_c: &[f64]) -> Result<Fields> {
    let mut fields = Fields::new().with(
        FieldId::CUSTODY,
        &Custody {
            distributor_id: "DIST-9".into(),
            distributor_name: "Northwind Logistics".into(),
            warehouse_id: "WH-NJ-2".into(),
            warehouse_location: "Newark, NJ".into(),
        },
    )?;
    if let Some(cc) = ColdChain::from_readings(readings_c, 12, Some(dual_hash(b"temp-log"))) {
        fields.set(FieldId::COLD_CHAIN, &cc)?;
    }
    Ok(fields)
}

/// Clean inputs for every pipeline stage, in order. The lot number is left
/// to the pipeline, so a second complete lot on the same ledger needs
/// [`encapsulation_fields_numbered`].
pub fn clean_lot() -> Result<Vec<(Stage, Fields)>> {
    Ok(vec![
        (Stage::Catch, catch_fields(1000.0)?),
        (Stage::Processing, processing_fields(150.0)?),
        (Stage::Testing, testing_fields(400.0, 300.0, 700.0)?),
        (Stage::Encapsulation, encapsulation_fields()?),
        (Stage::Distribution, distribution_fields(&[4.0, 5.0, 3.5, 6.0])?),
    ])
}
