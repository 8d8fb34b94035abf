//! Record-boundary recovery and field extraction for settlement exports.
//!
//! Exports carry no reliable record separator. Every transaction does carry a
//! fixed-grammar anchor (date+flag, session+grade, market code), so records
//! are segmented on anchor matches and every other field is located relative
//! to its anchor:
//!
//! ```text
//! <serial ...> <date+flag:8> <ws> <session><grade><letter>00<coop:3><lot:3> <variety/pieces>+<kg>+<price>+<total>[+...]+<buyer>
//! ```

use std::sync::OnceLock;

use amis_core::{decode_anchor_date, tables, Grade, TransactionRecord};
use regex::{CaptureMatches, Captures, Regex};
use thiserror::Error;
use tracing::trace;

/// Upper bound on how far past an anchor the numeric fields are searched.
pub const LOOKAHEAD_CHARS: usize = 150;

/// piece/weight/price/total
pub const MIN_NUMERIC_FIELDS: usize = 4;

pub const BUYER_CODE_MAX_CHARS: usize = 4;
pub const PIECE_COUNT_DIGITS: usize = 3;

fn anchor_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?P<date>[0-9]{8})\s+(?P<session>[0-9])(?P<grade>[0-9])(?P<code>(?P<coop>[A-Z]00[0-9]{3})(?P<lot>[0-9]{3}))",
        )
        .expect("valid anchor regex")
    })
}

fn variety_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[A-Z][A-Z0-9]*").expect("valid variety regex"))
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractError {
    #[error("implausible trade date field {0:?}")]
    ImplausibleDate(String),
    #[error("market prefix {0:?} is not tracked")]
    UnknownMarket(String),
    #[error("empty serial segment")]
    EmptySerial,
    #[error("expected at least {expected} '+' fields, found {found}")]
    MissingFields { expected: usize, found: usize },
    #[error("{field} field is empty")]
    EmptyField { field: &'static str },
    #[error("{field} field {raw:?} is not numeric")]
    InvalidNumber { field: &'static str, raw: String },
}

/// The fixed-grammar core of one transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnchorMatch<'t> {
    pub start: usize,
    pub end: usize,
    pub date_field: &'t str,
    pub session_code: &'t str,
    pub grade_code: &'t str,
    /// Full market code, `<letter>00<6 digits>`.
    pub market_code: &'t str,
    pub cooperative_code: &'t str,
    pub sub_lot_code: &'t str,
}

impl<'t> AnchorMatch<'t> {
    fn from_captures(caps: &Captures<'t>) -> Option<Self> {
        let whole = caps.get(0)?;
        Some(Self {
            start: whole.start(),
            end: whole.end(),
            date_field: caps.name("date")?.as_str(),
            session_code: caps.name("session")?.as_str(),
            grade_code: caps.name("grade")?.as_str(),
            market_code: caps.name("code")?.as_str(),
            cooperative_code: caps.name("coop")?.as_str(),
            sub_lot_code: caps.name("lot")?.as_str(),
        })
    }

    pub fn market_prefix(&self) -> &'t str {
        &self.market_code[..2]
    }
}

/// Source text believed to belong to one transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecordBlock<'t> {
    /// Text between the previous block's end and this anchor; for the first
    /// block, the serial-shaped tail of the text before it.
    pub serial_segment: &'t str,
    pub anchor: AnchorMatch<'t>,
    /// `+`-separated fields; field 0 is everything between anchor and first `+`.
    pub fields: Vec<&'t str>,
    /// Byte offset just past the last numeric field.
    pub end: usize,
}

/// Locate the `+`-delimited data fields following an anchor.
///
/// Returns the fields and the offset where the block ends. The scan stops at
/// `limit` (the next anchor), after [`LOOKAHEAD_CHARS`], or at the first
/// character past the first `+` that is not a digit, whitespace or `+`.
fn scan_data_fields(text: &str, start: usize, limit: usize) -> (Vec<&str>, usize) {
    let bounded = &text[start..limit];
    let window_len = bounded
        .char_indices()
        .nth(LOOKAHEAD_CHARS)
        .map(|(i, _)| i)
        .unwrap_or(bounded.len());
    let window = &bounded[..window_len];

    let Some(first_plus) = window.find('+') else {
        return (Vec::new(), start);
    };
    let tail = &window[first_plus..];
    let tail_len = tail
        .char_indices()
        .find(|(_, c)| !(c.is_ascii_digit() || c.is_whitespace() || *c == '+'))
        .map(|(i, _)| i)
        .unwrap_or(tail.len());
    let tail = &tail[..tail_len];
    let last_plus = tail.rfind('+').unwrap_or(0);

    let after = &tail[last_plus + 1..];
    let leading_ws = after.len() - after.trim_start().len();
    let digits = after[leading_ws..]
        .bytes()
        .take_while(u8::is_ascii_digit)
        .count();
    let last_field_len = if digits == 0 { 0 } else { leading_ws + digits };
    let numeric_end = last_plus + 1 + last_field_len;

    let mut fields = vec![&window[..first_plus]];
    fields.extend(tail[1..numeric_end].split('+'));
    (fields, start + first_plus + numeric_end)
}

fn is_serial_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, ' ' | '\t' | '\r')
}

/// Start of the serial-shaped run that ends at `end`, stopping at a line break.
fn serial_run_start(text: &str, end: usize) -> usize {
    text[..end]
        .char_indices()
        .rev()
        .take_while(|(_, c)| is_serial_char(*c))
        .last()
        .map(|(i, _)| i)
        .unwrap_or(end)
}

/// Serial start for the first anchor of a file. Only the serial-shaped tail of
/// the anchor's line is kept, so a title or report header never leaks into the
/// serial. An anchor that opens its line takes the tail of the previous line.
fn first_serial_start(text: &str, anchor_start: usize) -> usize {
    let start = serial_run_start(text, anchor_start);
    let wrapped = text[start..anchor_start].trim().is_empty() && text[..start].ends_with('\n');
    if wrapped {
        serial_run_start(text, start - 1)
    } else {
        start
    }
}

/// Anchor-driven segmentation into [`RawRecordBlock`]s, in source order.
pub struct RecordBlocks<'t> {
    text: &'t str,
    anchors: std::iter::Peekable<CaptureMatches<'static, 't>>,
    cursor: usize,
}

impl<'t> Iterator for RecordBlocks<'t> {
    type Item = RawRecordBlock<'t>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let caps = self.anchors.next()?;
            let Some(anchor) = AnchorMatch::from_captures(&caps) else {
                continue;
            };
            let next_start = self
                .anchors
                .peek()
                .and_then(|c| c.get(0))
                .map(|m| m.start())
                .unwrap_or(self.text.len());

            let serial_start = if self.cursor == 0 {
                first_serial_start(self.text, anchor.start)
            } else {
                self.cursor.min(anchor.start)
            };
            let (fields, block_end) = scan_data_fields(self.text, anchor.end, next_start);
            let end = block_end.max(anchor.end);
            self.cursor = end;

            return Some(RawRecordBlock {
                serial_segment: &self.text[serial_start..anchor.start],
                anchor,
                fields,
                end,
            });
        }
    }
}

pub fn segment(text: &str) -> RecordBlocks<'_> {
    RecordBlocks {
        text,
        anchors: anchor_re().captures_iter(text).peekable(),
        cursor: 0,
    }
}

fn parse_count(field: &'static str, raw: &str) -> Result<u64, ExtractError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(0);
    }
    trimmed.parse().map_err(|_| ExtractError::InvalidNumber {
        field,
        raw: raw.to_string(),
    })
}

/// Drop the trailing check digit (literally the last character), then parse.
fn parse_with_check_digit(field: &'static str, raw: &str) -> Result<u64, ExtractError> {
    let mut chars = raw.chars();
    if chars.next_back().is_none() {
        return Err(ExtractError::EmptyField { field });
    }
    parse_count(field, chars.as_str())
}

fn piece_count(field0: &str) -> Result<u64, ExtractError> {
    let digits: String = field0.chars().filter(char::is_ascii_digit).collect();
    let tail = &digits[digits.len().saturating_sub(PIECE_COUNT_DIGITS)..];
    parse_count("piece_count", tail)
}

/// First upper-case token of field 0, narrowed to the longest known variety
/// prefix. Unknown tokens pass through verbatim.
fn variety_code(field0: &str) -> String {
    let Some(token) = variety_re().find(field0).map(|m| m.as_str()) else {
        return String::new();
    };
    (1..=token.len())
        .rev()
        .map(|len| &token[..len])
        .find(|candidate| tables::is_known_variety(candidate))
        .unwrap_or(token)
        .to_string()
}

/// Turn one segmented block into a canonical record.
pub fn extract_fields(block: &RawRecordBlock<'_>) -> Result<TransactionRecord, ExtractError> {
    let anchor = &block.anchor;
    let trade_date = decode_anchor_date(anchor.date_field)
        .ok_or_else(|| ExtractError::ImplausibleDate(anchor.date_field.to_string()))?;

    let market_code = anchor.market_prefix();
    let market = tables::market_name(market_code)
        .ok_or_else(|| ExtractError::UnknownMarket(market_code.to_string()))?;

    let serial_id: String = block
        .serial_segment
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    if serial_id.is_empty() {
        return Err(ExtractError::EmptySerial);
    }

    if block.fields.len() < MIN_NUMERIC_FIELDS {
        return Err(ExtractError::MissingFields {
            expected: MIN_NUMERIC_FIELDS,
            found: block.fields.len(),
        });
    }
    let field0 = block.fields[0];
    let piece_count = piece_count(field0)?;
    let weight_kg = parse_count("weight_kg", block.fields[1])?;
    let unit_price = parse_with_check_digit("unit_price", block.fields[2])?;
    let total_value = parse_with_check_digit("total_value", block.fields[3])?;
    let buyer_code = if block.fields.len() > MIN_NUMERIC_FIELDS {
        block.fields[block.fields.len() - 1]
            .trim()
            .chars()
            .take(BUYER_CODE_MAX_CHARS)
            .collect()
    } else {
        String::new()
    };

    Ok(TransactionRecord {
        serial_id,
        trade_date,
        grade: Grade::from_code(anchor.grade_code),
        market_code: market_code.to_string(),
        market: market.to_string(),
        cooperative_code: anchor.cooperative_code.to_string(),
        sub_lot_code: anchor.sub_lot_code.to_string(),
        variety: variety_code(field0),
        piece_count,
        weight_kg,
        unit_price,
        total_value,
        buyer_code,
    })
}

/// Best-effort record stream over one decoded export. Blocks that fail
/// extraction are skipped and counted.
pub struct Records<'t> {
    blocks: RecordBlocks<'t>,
    skipped: usize,
}

impl Records<'_> {
    pub fn skipped(&self) -> usize {
        self.skipped
    }
}

impl Iterator for Records<'_> {
    type Item = TransactionRecord;

    fn next(&mut self) -> Option<Self::Item> {
        for block in self.blocks.by_ref() {
            match extract_fields(&block) {
                Ok(record) => return Some(record),
                Err(err) => {
                    self.skipped += 1;
                    trace!(offset = block.anchor.start, error = %err, "skipping record");
                }
            }
        }
        None
    }
}

pub fn extract_records(text: &str) -> Records<'_> {
    Records {
        blocks: segment(text),
        skipped: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    const ILLUSTRATIVE: &str = "A11150210  11S00076001 003+00018+01400+000002520+0000+6000";

    fn only(text: &str) -> TransactionRecord {
        let records: Vec<_> = extract_records(text).collect();
        assert_eq!(records.len(), 1, "{records:?}");
        records.into_iter().next().unwrap()
    }

    #[test]
    fn illustrative_fragment_yields_expected_field_roles() {
        let record = only(ILLUSTRATIVE);
        assert_eq!(record.serial_id, "A");
        assert_eq!(record.trade_date, NaiveDate::from_ymd_opt(2026, 2, 10).unwrap());
        assert_eq!(record.grade, Grade::Premium);
        assert_eq!(record.market_code, "S0");
        assert_eq!(record.market, "高雄縣");
        assert_eq!(record.cooperative_code, "S00076");
        assert_eq!(record.sub_lot_code, "001");
        assert_eq!(record.piece_count, 3);
        assert_eq!(record.weight_kg, 18);
        assert_eq!(record.unit_price, 140);
        assert_eq!(record.total_value, 252);
        assert_eq!(record.buyer_code, "6000");
        assert_eq!(record.variety, "");
    }

    #[test]
    fn consecutive_records_split_on_anchors_not_delimiters() {
        let text = concat!(
            "A1 0001 11502101  12T00021004 J1 012+00060+00850+000051000+0000+6120",
            "      A1 0002\n11502101   23T00021005 R1003+00030+01200+000036000+0000+6121",
            " A1 0003 11502111 11T00045002 P1 001+00010+00500+000005000+0000+7001"
        );
        let records: Vec<_> = extract_records(text).collect();
        assert_eq!(records.len(), 3);

        assert_eq!(records[0].serial_id, "A10001");
        assert_eq!(records[0].grade, Grade::Superior);
        assert_eq!(records[0].variety, "J1");
        assert_eq!(records[0].piece_count, 12);
        assert_eq!(records[0].unit_price, 85);
        assert_eq!(records[0].total_value, 5100);
        assert_eq!(records[0].buyer_code, "6120");

        // Serial wrapped across a line break, variety glued to the piece count.
        assert_eq!(records[1].serial_id, "A10002");
        assert_eq!(records[1].grade, Grade::Good);
        assert_eq!(records[1].variety, "R1");
        assert_eq!(records[1].piece_count, 3);
        assert_eq!(records[1].sub_lot_code, "005");

        assert_eq!(records[2].serial_id, "A10003");
        assert_eq!(records[2].cooperative_code, "T00045");
        assert_eq!(records[2].trade_date, NaiveDate::from_ymd_opt(2026, 2, 11).unwrap());
    }

    #[test]
    fn buyer_code_is_truncated_and_noise_stays_out_of_next_serial() {
        let text = concat!(
            "B7 11502101  11T00021001 J1 002+00010+00900+000009000+0000+612099",
            " B8 11502101  11T00021002 J1 002+00010+00900+000009000+0000+6121"
        );
        let records: Vec<_> = extract_records(text).collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].buyer_code, "6120");
        assert_eq!(records[1].serial_id, "B8");
    }

    #[test]
    fn unknown_market_prefix_yields_nothing() {
        let text = "A1 11502101  11Z00076001 003+00018+01400+000002520+0000+6000";
        let mut records = extract_records(text);
        assert!(records.next().is_none());
        assert_eq!(records.skipped(), 1);
    }

    #[test]
    fn missing_total_field_yields_nothing() {
        assert_eq!(
            extract_records("A1 11502101  11S00076001 003+00018+01400+").count(),
            0
        );
        assert_eq!(
            extract_records("A1 11502101  11S00076001 003+00018+01400 B2").count(),
            0
        );
    }

    #[test]
    fn implausible_date_is_dropped_but_scanning_continues() {
        let text = concat!(
            "A1 99999999  11S00076001 003+00018+01400+000002520+0000+6000",
            " A2 11502101  11S00076002 003+00018+01400+000002520+0000+6000"
        );
        let mut records = extract_records(text);
        let first = records.next().unwrap();
        assert_eq!(first.serial_id, "A2");
        assert!(records.next().is_none());
        assert_eq!(records.skipped(), 1);
    }

    #[test]
    fn check_digit_strip_is_textual() {
        assert_eq!(parse_with_check_digit("unit_price", "02300").unwrap(), 230);
        // A trailing blank is the character that gets stripped.
        assert_eq!(parse_with_check_digit("unit_price", "02300 ").unwrap(), 2300);
        assert_eq!(parse_with_check_digit("unit_price", "   ").unwrap(), 0);
        assert_eq!(
            parse_with_check_digit("unit_price", ""),
            Err(ExtractError::EmptyField { field: "unit_price" })
        );
        assert!(matches!(
            parse_with_check_digit("unit_price", "12x45"),
            Err(ExtractError::InvalidNumber { .. })
        ));
    }

    #[test]
    fn blank_numeric_fields_parse_as_zero() {
        let record = only("A1 11502101  11S00076001 003+     +01400+000002520+0000+6000");
        assert_eq!(record.weight_kg, 0);
        let record = only("A1 11502101  11S00076001    +00010+01400+000002520+0000+6000");
        assert_eq!(record.piece_count, 0);
    }

    #[test]
    fn unknown_codes_pass_through() {
        let record = only("A1 11502101  17S00076001 QX9 004+00018+01400+000002520+0000+6000");
        assert_eq!(record.grade, Grade::Other("7".into()));
        assert_eq!(record.variety, "QX9");
        assert_eq!(record.piece_count, 4);
    }

    #[test]
    fn exactly_four_fields_leave_buyer_empty() {
        let record = only("A1 11502101  11S00076001 003+00018+01400+000002520");
        assert_eq!(record.total_value, 252);
        assert_eq!(record.buyer_code, "");
    }

    #[test]
    fn lookahead_window_bounds_runaway_scans() {
        let padding = " ".repeat(LOOKAHEAD_CHARS + 10);
        let text = format!("A1 11502101  11S00076001{padding}003+00018+01400+000002520+0000+6000");
        assert_eq!(extract_records(&text).count(), 0);
    }

    #[test]
    fn segmentation_tolerates_multibyte_noise() {
        let text = "台北市農會 交易明細\u{FFFD}\nA1 11502101  11S00076001 003+00018+01400+000002520+0000+6000";
        let record = only(text);
        assert_eq!(record.serial_id, "A1");
        let blocks: Vec<_> = segment(text).collect();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].fields.len(), 6);
        assert_eq!(blocks[0].end, text.len());
    }

    #[test]
    fn file_header_stays_out_of_the_first_serial() {
        let record = only("SETTLEMENT REPORT 115/02/10\nA1 11502101  11S00076001 003+00018+01400+000002520+0000+6000");
        assert_eq!(record.serial_id, "A1");

        let record = only("Report\r\nA1 0002\r\n11502101  11S00076001 003+00018+01400+000002520+0000+6000");
        assert_eq!(record.serial_id, "A10002");
    }

    #[test]
    fn first_and_mid_file_copies_share_a_serial() {
        let line = "A1 11502101  11S00076001 003+00018+01400+000002520+0000+6000";
        let day = format!("台北市農會 交易明細\n{line}\n");
        let range = format!(
            "台北市農會 交易明細\nZ9 11502091  11S00076002 001+00005+00500+000000250+0000+6001\n{line}\n"
        );
        let first: Vec<_> = extract_records(&day).collect();
        let mid: Vec<_> = extract_records(&range).collect();
        assert_eq!(first.len(), 1);
        assert_eq!(mid.len(), 2);
        assert_eq!(mid[0].serial_id, "Z9");
        assert_eq!(first[0], mid[1]);
        assert_eq!(first[0].dedup_key(), mid[1].dedup_key());
    }

    #[test]
    fn every_output_record_has_valid_date_and_tracked_market() {
        let text = concat!(
            "X1 11502101  11S00076001 003+00018+01400+000002520+0000+6000 ",
            "X2 11513401  11S00076002 003+00018+01400+000002520+0000+6000 ",
            "X3 11502101  11Y00076003 003+00018+01400+000002520+0000+6000 ",
            "X4 11502121  21T00021004 003+00018+01400+000002520+0000+6000"
        );
        let records: Vec<_> = extract_records(text).collect();
        assert_eq!(records.len(), 2);
        for record in records {
            assert!(tables::market_name(&record.market_code).is_some());
            assert_ne!(record.market, "other");
        }
    }
}
