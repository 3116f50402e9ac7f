//! DualHash: the composite `SHA256_<hex>:BLAKE3_<hex>` digest.
//!
//! Chain linking always uses the full dual string. Merkle trees use only the
//! fast BLAKE3 half (see [`crate::merkle`]).

use std::sync::LazyLock;

use sha2::{Digest, Sha256};

pub const STRONG_PREFIX: &str = "SHA256_";
pub const FAST_PREFIX: &str = "BLAKE3_";
pub const SEPARATOR: char = ':';

/// `previous_hash` of the genesis receipt: both halves all-zero.
pub static GENESIS_HASH: LazyLock<String> = LazyLock::new(|| {
    let zeros = "0".repeat(64);
    format!("{STRONG_PREFIX}{zeros}{SEPARATOR}{FAST_PREFIX}{zeros}")
});

static DUAL_HASH_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"^SHA256_[0-9a-f]{64}:BLAKE3_[0-9a-f]{64}$").expect("static regex")
});

// ---------------------------------------------------------------------------
// Primitives
// ---------------------------------------------------------------------------

pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut h = Sha256::new();
    h.update(data);
    h.finalize().into()
}

pub fn blake3(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

/// Compute `SHA256_<hex>:BLAKE3_<hex>` over the exact same bytes.
pub fn dual_hash(data: &[u8]) -> String {
    let out = format!(
        "{STRONG_PREFIX}{}{SEPARATOR}{FAST_PREFIX}{}",
        hex::encode(sha256(data)),
        hex::encode(blake3(data)),
    );
    debug_assert!(out.contains(SEPARATOR));
    out
}

pub fn verify_dual_hash(data: &[u8], expected: &str) -> bool {
    dual_hash(data) == expected
}

/// Strict format check: lowercase hex, both prefixes, single separator.
pub fn is_dual_hash(s: &str) -> bool {
    DUAL_HASH_RE.is_match(s)
}

pub fn genesis_hash() -> &'static str {
    GENESIS_HASH.as_str()
}

/// The hex digest of the fast (BLAKE3) half, if `dual` is well-formed.
pub fn fast_component(dual: &str) -> Option<&str> {
    let (_, fast) = dual.split_once(SEPARATOR)?;
    fast.strip_prefix(FAST_PREFIX)
}

/// The hex digest of the strong (SHA-256) half, if `dual` is well-formed.
pub fn strong_component(dual: &str) -> Option<&str> {
    let (strong, _) = dual.split_once(SEPARATOR)?;
    strong.strip_prefix(STRONG_PREFIX)
}
