//! Time helpers, identifier validation, numeric formatting, and build metadata.

use time::{
    format_description::well_known::Rfc3339, macros::format_description, Date, OffsetDateTime,
    PrimitiveDateTime,
};

use crate::error::ValidationError;

// ---------------------------------------------------------------------------
// Time
// ---------------------------------------------------------------------------

pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}

pub fn now_utc_rfc3339() -> String {
    format_rfc3339(now_utc())
}

pub fn format_rfc3339(ts: OffsetDateTime) -> String {
    ts.format(&Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

/// Calendar date of an ISO-8601 date or date-time string.
///
/// Accepts `YYYY-MM-DD`, a local `YYYY-MM-DDTHH:MM:SS[.fff]`, or RFC 3339
/// with an offset.
pub fn parse_iso8601_date(s: &str) -> Option<Date> {
    if let Ok(d) = Date::parse(s, format_description!("[year]-[month]-[day]")) {
        return Some(d);
    }
    if let Ok(ts) = OffsetDateTime::parse(s, &Rfc3339) {
        return Some(ts.date());
    }
    PrimitiveDateTime::parse(
        s,
        format_description!("[year]-[month]-[day]T[hour]:[minute]:[second][optional [.[subsecond]]]"),
    )
    .ok()
    .map(PrimitiveDateTime::date)
}

// ---------------------------------------------------------------------------
// Validation helpers
// ---------------------------------------------------------------------------

/// Lot identifiers: starts with alphanumeric, then up to 63 more
/// alphanumeric / hyphen / dot / underscore characters.
static LOT_ID_RE: std::sync::LazyLock<regex::Regex> = std::sync::LazyLock::new(|| {
    regex::Regex::new(r"^[A-Za-z0-9][A-Za-z0-9\-_.]{0,63}$").expect("static regex")
});

/// Validate a lot identifier format.
pub fn validate_lot_id(lot: &str) -> std::result::Result<(), ValidationError> {
    if !LOT_ID_RE.is_match(lot) {
        return Err(ValidationError::InvalidLotId(lot.to_string()));
    }
    Ok(())
}

/// Generate a lot number in the `LOT-YYYY-MMDD-XX` house format, where `XX`
/// is the upper-cased tail of the batch id.
pub fn generate_lot_number(batch_id: &str, at: Date) -> String {
    let suffix: String = if batch_id.chars().count() >= 2 {
        let tail: Vec<char> = batch_id.chars().rev().take(2).collect();
        tail.into_iter().rev().collect::<String>().to_uppercase()
    } else {
        "XX".to_string()
    };
    format!(
        "LOT-{}-{:02}{:02}-{}",
        at.year(),
        u8::from(at.month()),
        at.day(),
        suffix
    )
}

/// Round to a fixed number of decimal places (half away from zero).
pub fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

// ---------------------------------------------------------------------------
// Version constants (set by build.rs)
// ---------------------------------------------------------------------------

pub const GIT_HASH: &str = env!("FISHOIL_GIT_HASH");
pub const BUILD_TS: &str = env!("FISHOIL_BUILD_TS");
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// One-line version string for display.
pub fn version_string() -> String {
    format!("fishoil-core v{VERSION} (git {GIT_HASH}, built {BUILD_TS})")
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::date;

    #[test]
    fn valid_lot_ids() {
        assert!(validate_lot_id("LOT-2025-0131-01").is_ok());
        assert!(validate_lot_id("lot_7.v2").is_ok());
        assert!(validate_lot_id("A").is_ok());
    }

    #[test]
    fn invalid_lot_ids() {
        assert!(validate_lot_id("").is_err());
        assert!(validate_lot_id("-leading-hyphen").is_err());
        assert!(validate_lot_id("has space").is_err());
        assert!(validate_lot_id(&"A".repeat(65)).is_err());
    }

    #[test]
    fn lot_number_uses_date_and_batch_tail() {
        let at = date!(2025 - 01 - 31);
        assert_eq!(generate_lot_number("BP-chain-ab", at), "LOT-2025-0131-AB");
        assert_eq!(generate_lot_number("x", at), "LOT-2025-0131-XX");
    }

    #[test]
    fn rounding_two_places() {
        assert_eq!(round_to(26.0999999, 2), 26.1);
        assert_eq!(round_to(0.14666, 4), 0.1467);
    }

    #[test]
    fn iso8601_dates() {
        assert_eq!(parse_iso8601_date("2025-02-03"), Some(date!(2025 - 02 - 03)));
        assert_eq!(parse_iso8601_date("2025-02-03T09:30:00"), Some(date!(2025 - 02 - 03)));
        assert_eq!(parse_iso8601_date("2025-02-03T09:30:00.250"), Some(date!(2025 - 02 - 03)));
        assert_eq!(parse_iso8601_date("2025-02-03T23:30:00-05:00"), Some(date!(2025 - 02 - 03)));
        assert_eq!(parse_iso8601_date("03/02/2025"), None);
        assert_eq!(parse_iso8601_date("2025-02-30"), None);
        assert_eq!(parse_iso8601_date(""), None);
    }

    #[test]
    fn version_string_non_empty() {
        assert!(version_string().contains("fishoil-core"));
    }
}
