//! Field identifiers, the ordered field map carried by every receipt, and the
//! typed records behind each of the fifteen tracked fields.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::error::{FishoilError, Result, ResultExt as _, ValidationError};
use crate::util;

// ---------------------------------------------------------------------------
// FieldId
// ---------------------------------------------------------------------------

/// One of the fifteen tracked supply-chain fields (1..=15).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldId(u8);

impl FieldId {
    pub const SPECIES: Self = Self(1);
    pub const FISHERY: Self = Self(2);
    pub const IMPORT_DOCS: Self = Self(3);
    pub const PROCESSING_FACILITY: Self = Self(4);
    pub const GMP_CERTIFICATION: Self = Self(5);
    pub const EXTRACTION: Self = Self(6);
    pub const YIELD: Self = Self(7);
    pub const LAB_CERTIFICATION: Self = Self(8);
    pub const CONTAMINANTS: Self = Self(9);
    pub const POTENCY: Self = Self(10);
    pub const OXIDATION: Self = Self(11);
    pub const CUSTODY: Self = Self(12);
    pub const FISHERY_CERTIFICATION: Self = Self(13);
    pub const BATCH_ID: Self = Self(14);
    pub const COLD_CHAIN: Self = Self(15);

    pub const MIN: u8 = 1;
    pub const MAX: u8 = 15;

    pub fn new(n: u8) -> Option<Self> {
        (Self::MIN..=Self::MAX).contains(&n).then_some(Self(n))
    }

    pub fn get(self) -> u8 {
        self.0
    }

    pub fn all() -> impl Iterator<Item = Self> {
        (Self::MIN..=Self::MAX).map(Self)
    }
}

impl fmt::Debug for FieldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for FieldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// FieldKey
// ---------------------------------------------------------------------------

/// Key of a receipt field: either a tracked, numbered field or a named
/// attribute (encapsulation details, anomaly metadata).
///
/// Ordering is tracked fields by number first, then named keys
/// lexicographically; the canonical encoding relies on it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FieldKey {
    Tracked(FieldId),
    Named(String),
}

impl FieldKey {
    pub fn named(name: &str) -> Self {
        Self::Named(name.to_string())
    }

    pub fn tracked(&self) -> Option<FieldId> {
        match self {
            Self::Tracked(id) => Some(*id),
            Self::Named(_) => None,
        }
    }
}

impl From<FieldId> for FieldKey {
    fn from(id: FieldId) -> Self {
        Self::Tracked(id)
    }
}

impl fmt::Display for FieldKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tracked(id) => write!(f, "{id}"),
            Self::Named(name) => f.write_str(name),
        }
    }
}

impl FromStr for FieldKey {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if s.is_empty() {
            return Err("empty field key".into());
        }
        if s.bytes().all(|b| b.is_ascii_digit()) {
            return s
                .parse::<u8>()
                .ok()
                .and_then(FieldId::new)
                .map(Self::Tracked)
                .ok_or_else(|| format!("field number {s} out of range 1-15"));
        }
        Ok(Self::Named(s.to_string()))
    }
}

impl Serialize for FieldKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for FieldKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Fields
// ---------------------------------------------------------------------------

/// Ordered field map of one receipt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fields(BTreeMap<FieldKey, Value>);

impl Fields {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a typed record under a tracked field.
    pub fn set<T: Serialize>(&mut self, id: FieldId, record: &T) -> Result<()> {
        let value = field_value(record, &id.to_string())?;
        self.0.insert(FieldKey::Tracked(id), value);
        Ok(())
    }

    /// Builder form of [`Fields::set`].
    pub fn with<T: Serialize>(mut self, id: FieldId, record: &T) -> Result<Self> {
        self.set(id, record)?;
        Ok(self)
    }

    /// Insert a named (non-numbered) attribute.
    pub fn set_named<T: Serialize>(&mut self, name: &str, value: &T) -> Result<()> {
        let key: FieldKey = name
            .parse()
            .map_err(|e| FishoilError::Encoding(format!("named field '{name}': {e}")))?;
        if key.tracked().is_some() {
            return Err(FishoilError::Encoding(format!(
                "named field '{name}' collides with a tracked field number"
            )));
        }
        let value = field_value(value, name)?;
        self.0.insert(key, value);
        Ok(())
    }

    pub fn with_named<T: Serialize>(mut self, name: &str, value: &T) -> Result<Self> {
        self.set_named(name, value)?;
        Ok(self)
    }

    pub fn get(&self, id: FieldId) -> Option<&Value> {
        self.0.get(&FieldKey::Tracked(id))
    }

    pub fn get_named(&self, name: &str) -> Option<&Value> {
        self.0.get(&FieldKey::Named(name.to_string()))
    }

    pub fn named_str(&self, name: &str) -> Option<&str> {
        self.get_named(name).and_then(Value::as_str)
    }

    pub fn contains(&self, id: FieldId) -> bool {
        self.0.contains_key(&FieldKey::Tracked(id))
    }

    /// Decode a tracked field into its typed record. `Ok(None)` when absent.
    pub fn record<T: DeserializeOwned>(&self, id: FieldId) -> std::result::Result<Option<T>, ValidationError> {
        self.get(id)
            .map(|v| {
                serde_json::from_value(v.clone()).map_err(|e| ValidationError::Malformed {
                    field: id,
                    reason: e.to_string(),
                })
            })
            .transpose()
    }

    pub fn tracked_ids(&self) -> impl Iterator<Item = FieldId> + '_ {
        self.0.keys().filter_map(FieldKey::tracked)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&FieldKey, &Value)> {
        self.0.iter()
    }

    /// Raw mutable access; used by tests that simulate storage tampering.
    pub fn insert_raw(&mut self, key: FieldKey, value: Value) -> Option<Value> {
        self.0.insert(key, value)
    }

    /// Copy every tracked field of `other` into `self` (later stages carry
    /// earlier stages' values forward).
    pub fn carry_from(&mut self, other: &Fields) {
        for (k, v) in &other.0 {
            if k.tracked().is_some() {
                self.0.insert(k.clone(), v.clone());
            }
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// serde_json maps NaN and infinities to `null`; the typed record then fails
// to decode during schema validation, so the bad value never gets hashed.
fn field_value<T: Serialize>(record: &T, label: &str) -> Result<Value> {
    serde_json::to_value(record).ctx_encoding(&format!("serialize field {label}"))
}

// ---------------------------------------------------------------------------
// Typed records
// ---------------------------------------------------------------------------

/// Field 2.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FisheryRecord {
    pub registry: String,
    pub catch_weight_kg: f64,
}

/// Field 3. `registry_hash` is the hash on file with the customs registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportDocs {
    pub hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry_hash: Option<String>,
}

/// Field 4.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Facility {
    pub id: String,
    pub name: String,
}

/// Fields 5 and 8.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Certification {
    pub holder: String,
    pub cert_type: String,
    pub cert_id: String,
    pub cert_hash: String,
}

/// Field 6.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Extraction {
    pub method: String,
    pub temp_c: f64,
}

/// Field 7. `input_kg` falls back to the carried catch weight when absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct YieldRecord {
    pub output_kg: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_kg: Option<f64>,
}

/// Field 9.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contaminants {
    pub mercury_ppm: f64,
    pub pcbs_ppm: f64,
    pub dioxins_pg_per_g: f64,
}

/// Field 10.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Potency {
    pub epa_mg: f64,
    pub dha_mg: f64,
    pub label_claim_mg: f64,
}

impl Potency {
    pub fn total_omega3_mg(&self) -> f64 {
        self.epa_mg + self.dha_mg
    }
}

/// Field 11.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Oxidation {
    pub peroxide_meq_per_kg: f64,
    pub anisidine: f64,
}

impl Oxidation {
    /// TOTOX = 2 x peroxide + anisidine, rounded to two decimals.
    pub fn totox(&self) -> f64 {
        util::round_to(2.0 * self.peroxide_meq_per_kg + self.anisidine, 2)
    }
}

/// Field 12.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Custody {
    pub distributor_id: String,
    pub distributor_name: String,
    pub warehouse_id: String,
    pub warehouse_location: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CertScheme {
    Msc,
    FriendOfSea,
    None,
}

/// Field 13.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FisheryCertification {
    pub scheme: CertScheme,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_hash: Option<String>,
}

impl FisheryCertification {
    pub fn is_claimed(&self) -> bool {
        self.scheme != CertScheme::None
    }
}

/// Cold-chain target band, degrees Celsius.
pub const COLD_CHAIN_TARGET_MIN_C: f64 = 2.0;
pub const COLD_CHAIN_TARGET_MAX_C: f64 = 8.0;

/// Field 15: summary of the transport temperature log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColdChain {
    pub max_temp_c: f64,
    pub min_temp_c: f64,
    pub avg_temp_c: f64,
    pub deviation_count: u32,
    pub duration_days: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_log_hash: Option<String>,
}

impl ColdChain {
    /// Summarise raw readings. `None` when there are no readings (cold chain
    /// not tracked for this shipment).
    pub fn from_readings(
        readings_c: &[f64],
        duration_days: u32,
        temp_log_hash: Option<String>,
    ) -> Option<Self> {
        if readings_c.is_empty() {
            return None;
        }
        let n = readings_c.len() as f64;
        let max = readings_c.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let min = readings_c.iter().copied().fold(f64::INFINITY, f64::min);
        let avg = readings_c.iter().sum::<f64>() / n;
        let deviations = readings_c
            .iter()
            .filter(|t| **t < COLD_CHAIN_TARGET_MIN_C || **t > COLD_CHAIN_TARGET_MAX_C)
            .count();
        Some(Self {
            max_temp_c: util::round_to(max, 2),
            min_temp_c: util::round_to(min, 2),
            avg_temp_c: util::round_to(avg, 2),
            deviation_count: u32::try_from(deviations).unwrap_or(u32::MAX),
            duration_days,
            temp_log_hash,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keys_order_numbered_then_named() {
        let fields = Fields::new()
            .with_named("capsule_count", &120)
            .unwrap()
            .with(FieldId::BATCH_ID, &"B-1")
            .unwrap()
            .with(FieldId::SPECIES, &"Engraulis ringens")
            .unwrap()
            .with(FieldId::YIELD, &YieldRecord { output_kg: 150.0, input_kg: None })
            .unwrap();
        let s = serde_json::to_string(&fields).unwrap();
        assert_eq!(
            s,
            r#"{"1":"Engraulis ringens","7":{"output_kg":150.0},"14":"B-1","capsule_count":120}"#
        );
    }

    #[test]
    fn key_parsing() {
        assert_eq!("7".parse::<FieldKey>(), Ok(FieldKey::Tracked(FieldId::YIELD)));
        assert_eq!("flag".parse::<FieldKey>(), Ok(FieldKey::named("flag")));
        assert!("0".parse::<FieldKey>().is_err());
        assert!("16".parse::<FieldKey>().is_err());
    }

    #[test]
    fn named_field_cannot_shadow_number() {
        assert!(Fields::new().set_named("3", &"x").is_err());
    }

    #[test]
    fn non_finite_numbers_fail_to_decode() {
        let bad = YieldRecord { output_kg: f64::NAN, input_kg: None };
        let fields = Fields::new().with(FieldId::YIELD, &bad).unwrap();
        assert!(fields.record::<YieldRecord>(FieldId::YIELD).is_err());
    }

    #[test]
    fn record_decodes_and_reports_malformed() {
        let mut fields = Fields::new();
        fields.insert_raw(FieldKey::Tracked(FieldId::POTENCY), json!({"epa_mg": "lots"}));
        let err = fields.record::<Potency>(FieldId::POTENCY).unwrap_err();
        assert!(matches!(err, ValidationError::Malformed { field, .. } if field == FieldId::POTENCY));
        assert_eq!(fields.record::<Potency>(FieldId::OXIDATION).unwrap(), None);
    }

    #[test]
    fn totox_rounds_to_two_places() {
        let ox = Oxidation { peroxide_meq_per_kg: 3.05, anisidine: 20.0 };
        assert_eq!(ox.totox(), 26.1);
    }

    #[test]
    fn cold_chain_summary() {
        let cc = ColdChain::from_readings(&[4.0, 5.0, 9.5, 1.0], 12, None).unwrap();
        assert_eq!(cc.max_temp_c, 9.5);
        assert_eq!(cc.min_temp_c, 1.0);
        assert_eq!(cc.deviation_count, 2);
        assert!(ColdChain::from_readings(&[], 3, None).is_none());
    }
}
