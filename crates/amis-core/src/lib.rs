//! Core domain model for cooperative settlement records.

use std::fmt;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

pub mod query;
pub mod tables;

pub use query::{sort_for_display, DisplayRecord, FacetCount, Facets, RecordFilter, Summary};

pub const CRATE_NAME: &str = "amis-core";

/// Offset between the minguo calendar year and the Gregorian year.
pub const MINGUO_YEAR_OFFSET: i32 = 1911;

/// Minguo years accepted as plausible trade dates (1991..=2061).
pub const MINGUO_YEAR_RANGE: std::ops::RangeInclusive<i32> = 80..=150;

/// Quality grade carried in the anchor; unknown codes are kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Grade {
    Premium,
    Superior,
    Good,
    Other(String),
}

impl Grade {
    pub fn from_code(code: &str) -> Self {
        match code {
            "1" => Grade::Premium,
            "2" => Grade::Superior,
            "3" => Grade::Good,
            other => Grade::Other(other.to_string()),
        }
    }

    pub fn code(&self) -> &str {
        match self {
            Grade::Premium => "1",
            Grade::Superior => "2",
            Grade::Good => "3",
            Grade::Other(code) => code,
        }
    }

    pub fn label(&self) -> String {
        match tables::grade_name(self.code()) {
            Some(name) => name.to_string(),
            None => self.code().to_string(),
        }
    }
}

impl fmt::Display for Grade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

/// One settled transaction recovered from a legacy export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub serial_id: String,
    pub trade_date: NaiveDate,
    pub grade: Grade,
    /// Two-character prefix of the anchor's market code.
    pub market_code: String,
    /// Resolved market name; never the "other" bucket.
    pub market: String,
    /// Supply number of the cooperative (`<letter>00<3 digits>`).
    pub cooperative_code: String,
    pub sub_lot_code: String,
    pub variety: String,
    pub piece_count: u64,
    pub weight_kg: u64,
    pub unit_price: u64,
    pub total_value: u64,
    pub buyer_code: String,
}

/// Identity of a real-world trade across overlapping exports.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DedupKey {
    pub serial_id: String,
    pub trade_date: NaiveDate,
    pub sub_lot_code: String,
    pub piece_count: u64,
    pub total_value: u64,
}

impl TransactionRecord {
    pub fn dedup_key(&self) -> DedupKey {
        DedupKey {
            serial_id: self.serial_id.clone(),
            trade_date: self.trade_date,
            sub_lot_code: self.sub_lot_code.clone(),
            piece_count: self.piece_count,
            total_value: self.total_value,
        }
    }

    pub fn cooperative_label(&self) -> String {
        tables::cooperative_name(&self.cooperative_code)
            .map(ToString::to_string)
            .unwrap_or_else(|| self.cooperative_code.clone())
    }

    pub fn variety_label(&self) -> String {
        tables::variety_name(&self.variety)
            .map(ToString::to_string)
            .unwrap_or_else(|| self.variety.clone())
    }
}

/// Decode a `YYYMMDD` minguo date. Returns `None` for anything that is not a
/// real calendar day inside [`MINGUO_YEAR_RANGE`].
pub fn decode_minguo_digits(digits: &str) -> Option<NaiveDate> {
    if digits.len() != 7 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let year: i32 = digits[0..3].parse().ok()?;
    let month: u32 = digits[3..5].parse().ok()?;
    let day: u32 = digits[5..7].parse().ok()?;
    if !MINGUO_YEAR_RANGE.contains(&year) {
        return None;
    }
    NaiveDate::from_ymd_opt(year + MINGUO_YEAR_OFFSET, month, day)
}

/// Decode the 8-digit date-plus-flag field of an anchor.
///
/// The date normally occupies the leading seven digits. Some exports carry
/// the flag first, so the trailing seven digits are tried when the leading
/// ones are not a plausible date.
pub fn decode_anchor_date(field: &str) -> Option<NaiveDate> {
    if field.len() != 8 || !field.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    decode_minguo_digits(&field[..7]).or_else(|| decode_minguo_digits(&field[1..]))
}

/// `YYY/MM/DD`, the form used by the settlement portal.
pub fn format_minguo(date: NaiveDate) -> String {
    format!(
        "{}/{:02}/{:02}",
        date.year() - MINGUO_YEAR_OFFSET,
        date.month(),
        date.day()
    )
}

/// `YYYMMDD`, used in harvested file names.
pub fn format_minguo_compact(date: NaiveDate) -> String {
    format_minguo(date).replace('/', "")
}
