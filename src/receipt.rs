//! Receipts: one immutable, hash-linked record per pipeline stage per lot.

use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::{FishoilError, Result, ResultExt as _, ValidationError};
use crate::fields::Fields;
use crate::hash;
use crate::util;

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    Catch,
    Processing,
    Testing,
    Encapsulation,
    Distribution,
    Anomaly,
}

impl Stage {
    /// The five lot stages in the order a lot must pass through them.
    pub const PIPELINE: [Stage; 5] = [
        Stage::Catch,
        Stage::Processing,
        Stage::Testing,
        Stage::Encapsulation,
        Stage::Distribution,
    ];

    /// Next pipeline stage; `None` after DISTRIBUTION and for ANOMALY.
    pub fn next(self) -> Option<Stage> {
        match self {
            Stage::Catch => Some(Stage::Processing),
            Stage::Processing => Some(Stage::Testing),
            Stage::Testing => Some(Stage::Encapsulation),
            Stage::Encapsulation => Some(Stage::Distribution),
            Stage::Distribution | Stage::Anomaly => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Catch => "CATCH",
            Stage::Processing => "PROCESSING",
            Stage::Testing => "TESTING",
            Stage::Encapsulation => "ENCAPSULATION",
            Stage::Distribution => "DISTRIBUTION",
            Stage::Anomaly => "ANOMALY",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// LotId
// ---------------------------------------------------------------------------

/// Validated lot identifier (see [`util::validate_lot_id`]).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct LotId(String);

impl LotId {
    pub fn new(s: impl Into<String>) -> std::result::Result<Self, ValidationError> {
        let s = s.into();
        util::validate_lot_id(&s)?;
        Ok(Self(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for LotId {
    type Error = ValidationError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<LotId> for String {
    fn from(id: LotId) -> Self {
        id.0
    }
}

impl fmt::Display for LotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Canonical encoding
// ---------------------------------------------------------------------------

/// Bytes fed to [`hash::dual_hash`] for a receipt's `payload_hash`.
///
/// Compact JSON of `{fields, lot_id, previous_hash, stage}`, keys in that
/// order. `fields` orders numbered keys 1..15 then named keys; nested
/// objects are key-sorted by `serde_json::Map`. This layout is frozen:
/// changing it invalidates every stored hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalBytes(Vec<u8>);

#[derive(Serialize)]
struct CanonicalPayload<'a> {
    fields: &'a Fields,
    lot_id: &'a str,
    previous_hash: &'a str,
    stage: Stage,
}

impl CanonicalBytes {
    pub fn for_payload(stage: Stage, lot_id: &LotId, fields: &Fields, previous_hash: &str) -> Result<Self> {
        let payload = CanonicalPayload {
            fields,
            lot_id: lot_id.as_str(),
            previous_hash,
            stage,
        };
        let bytes = serde_json::to_vec(&payload).ctx_encoding("canonical receipt payload")?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

// ---------------------------------------------------------------------------
// Receipt
// ---------------------------------------------------------------------------

/// One ledger line.
///
/// `sequence_number` is 0 until the ledger assigns it (numbering starts at
/// 1). `sequence_number` and `timestamp` are ledger metadata and are not part
/// of the hashed payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Receipt {
    pub sequence_number: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub stage: Stage,
    pub lot_id: LotId,
    pub fields: Fields,
    pub previous_hash: String,
    pub payload_hash: String,
}

impl Receipt {
    /// Build a receipt and compute its `payload_hash`.
    pub fn new(
        stage: Stage,
        lot_id: LotId,
        fields: Fields,
        previous_hash: impl Into<String>,
        timestamp: OffsetDateTime,
    ) -> Result<Self> {
        let previous_hash = previous_hash.into();
        let payload_hash = compute_payload_hash(stage, &lot_id, &fields, &previous_hash)?;
        Ok(Self {
            sequence_number: 0,
            timestamp,
            stage,
            lot_id,
            fields,
            previous_hash,
            payload_hash,
        })
    }

    pub fn canonical_bytes(&self) -> Result<CanonicalBytes> {
        CanonicalBytes::for_payload(self.stage, &self.lot_id, &self.fields, &self.previous_hash)
    }

    /// Recompute the hash from the receipt's own content.
    pub fn recompute_hash(&self) -> Result<String> {
        Ok(hash::dual_hash(self.canonical_bytes()?.as_bytes()))
    }

    /// Stored `payload_hash` equals the recomputed one.
    pub fn is_self_consistent(&self) -> bool {
        self.recompute_hash()
            .map(|h| h == self.payload_hash)
            .unwrap_or(false)
    }

    pub fn is_genesis(&self) -> bool {
        self.previous_hash == hash::genesis_hash()
    }

    pub fn is_anomaly(&self) -> bool {
        self.stage == Stage::Anomaly
    }

    /// Serialise as one newline-terminated JSONL record.
    pub fn to_json_line(&self) -> Result<String> {
        let mut line = serde_json::to_string(self).ctx_encoding("serialize receipt")?;
        line.push('\n');
        Ok(line)
    }

    pub fn from_json_line(line: &str) -> Result<Self> {
        serde_json::from_str(line.trim_end_matches(['\n', '\r']))
            .map_err(|e| FishoilError::InvalidReceipt(e.to_string()))
    }
}

pub fn compute_payload_hash(stage: Stage, lot_id: &LotId, fields: &Fields, previous_hash: &str) -> Result<String> {
    let bytes = CanonicalBytes::for_payload(stage, lot_id, fields, previous_hash)?;
    Ok(hash::dual_hash(bytes.as_bytes()))
}
