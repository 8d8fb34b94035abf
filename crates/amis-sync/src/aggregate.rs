//! Cross-file deduplication of extracted records.

use std::collections::HashSet;

use amis_core::{sort_for_display, DedupKey, TransactionRecord};

/// Single-pass dedup over records in processing order. The first record seen
/// for a [`DedupKey`] survives.
#[derive(Debug, Default)]
pub struct DedupAggregator {
    seen: HashSet<DedupKey>,
    records: Vec<TransactionRecord>,
    duplicates: usize,
}

impl DedupAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` when the record was a duplicate and got dropped.
    pub fn push(&mut self, record: TransactionRecord) -> bool {
        if self.seen.insert(record.dedup_key()) {
            self.records.push(record);
            true
        } else {
            self.duplicates += 1;
            false
        }
    }

    /// Feed one file's records; returns how many were kept.
    pub fn extend(&mut self, records: impl IntoIterator<Item = TransactionRecord>) -> usize {
        let mut kept = 0;
        for record in records {
            if self.push(record) {
                kept += 1;
            }
        }
        kept
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn duplicates(&self) -> usize {
        self.duplicates
    }

    /// Surviving records in display order.
    pub fn finish(self) -> Vec<TransactionRecord> {
        let mut records = self.records;
        sort_for_display(&mut records);
        records
    }
}

/// Dedup a list of per-file record sets, in file order.
pub fn aggregate<I>(files: I) -> Vec<TransactionRecord>
where
    I: IntoIterator,
    I::Item: IntoIterator<Item = TransactionRecord>,
{
    let mut aggregator = DedupAggregator::new();
    for file in files {
        aggregator.extend(file);
    }
    aggregator.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use amis_core::Grade;
    use chrono::NaiveDate;

    #[test]
    fn trade_first_in_one_export_and_mid_file_in_another_is_kept_once() {
        let line = "A1 11502101  11S00076001 003+00018+01400+000002520+0000+6000";
        let day = format!("COOP SETTLEMENT 1150210\n{line}\n");
        let range = format!(
            "COOP SETTLEMENT 1150209-1150210\nZ9 11502091  11S00076002 001+00005+00500+000000250+0000+6001\n{line}\n"
        );
        let files = [day, range].map(|body| amis_adapters::parse_export(body.as_bytes()).records);
        let merged = aggregate(files);
        let serials: Vec<_> = merged.iter().map(|r| r.serial_id.as_str()).collect();
        assert_eq!(serials, vec!["A1", "Z9"]);
    }

    fn record(serial: &str, day: u32, lot: &str, pieces: u64, total: u64, price: u64) -> TransactionRecord {
        TransactionRecord {
            serial_id: serial.to_string(),
            trade_date: NaiveDate::from_ymd_opt(2026, 2, day).unwrap(),
            grade: Grade::Premium,
            market_code: "S0".to_string(),
            market: "高雄縣".to_string(),
            cooperative_code: "S00076".to_string(),
            sub_lot_code: lot.to_string(),
            variety: "R1".to_string(),
            piece_count: pieces,
            weight_kg: 18,
            unit_price: price,
            total_value: total,
            buyer_code: "6000".to_string(),
        }
    }

    #[test]
    fn overlapping_files_emit_each_trade_once() {
        let day_file = vec![record("A1", 10, "001", 3, 252, 140), record("A2", 10, "002", 5, 240, 80)];
        let range_file = vec![record("A1", 10, "001", 3, 252, 140), record("A3", 11, "001", 2, 120, 120)];
        let out = aggregate(vec![day_file, range_file]);
        assert_eq!(out.len(), 3);
        let serials: Vec<_> = out.iter().map(|r| r.serial_id.as_str()).collect();
        assert_eq!(serials, vec!["A3", "A1", "A2"]);
    }

    #[test]
    fn first_seen_wins_on_key_collision() {
        let mut first = record("A1", 10, "001", 3, 252, 140);
        first.buyer_code = "6000".to_string();
        let mut later = first.clone();
        later.buyer_code = "6012".to_string();
        later.weight_kg = 99;

        let mut agg = DedupAggregator::new();
        assert!(agg.push(first));
        assert!(!agg.push(later));
        assert_eq!(agg.duplicates(), 1);
        let out = agg.finish();
        assert_eq!(out[0].buyer_code, "6000");
        assert_eq!(out[0].weight_kg, 18);
    }

    #[test]
    fn any_key_component_difference_keeps_both() {
        let base = record("A1", 10, "001", 3, 252, 140);
        let variants = vec![
            base.clone(),
            record("A9", 10, "001", 3, 252, 140),
            record("A1", 11, "001", 3, 252, 140),
            record("A1", 10, "002", 3, 252, 140),
            record("A1", 10, "001", 4, 252, 140),
            record("A1", 10, "001", 3, 253, 140),
        ];
        assert_eq!(aggregate(vec![variants]).len(), 6);
    }

    #[test]
    fn rerunning_on_the_same_files_is_idempotent() {
        let files = vec![
            vec![record("A1", 10, "001", 3, 252, 140), record("A1", 10, "001", 3, 252, 140)],
            vec![record("B1", 11, "003", 1, 50, 50)],
        ];
        let once = aggregate(files.clone());
        let twice = aggregate(vec![once.clone()]);
        assert_eq!(once, twice);

        let mut reversed = files;
        reversed.reverse();
        let mut a: Vec<_> = once.iter().map(TransactionRecord::dedup_key).collect();
        let mut b: Vec<_> = aggregate(reversed).iter().map(TransactionRecord::dedup_key).collect();
        a.sort();
        b.sort();
        assert_eq!(a, b);
    }

    #[test]
    fn output_is_sorted_by_date_then_price_descending() {
        let out = aggregate(vec![vec![
            record("A1", 10, "001", 1, 10, 50),
            record("A2", 11, "001", 1, 20, 30),
            record("A3", 10, "002", 1, 30, 90),
        ]]);
        let order: Vec<_> = out.iter().map(|r| r.serial_id.as_str()).collect();
        assert_eq!(order, vec!["A2", "A3", "A1"]);
    }
}
