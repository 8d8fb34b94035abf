//! Filtering, facets and aggregate summaries over canonical records.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::{format_minguo, TransactionRecord};

/// Filter applied by the dashboard. Empty strings behave like `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordFilter {
    /// Exact market name.
    pub market: Option<String>,
    /// Exact cooperative supply number.
    pub cooperative: Option<String>,
    /// Exact variety code.
    pub variety: Option<String>,
    pub sub_lot_contains: Option<String>,
    pub buyer_contains: Option<String>,
    /// Inclusive lower bound.
    pub date_from: Option<NaiveDate>,
    /// Inclusive upper bound.
    pub date_to: Option<NaiveDate>,
}

fn active(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

impl RecordFilter {
    pub fn matches(&self, record: &TransactionRecord) -> bool {
        if let Some(market) = active(&self.market) {
            if record.market != market {
                return false;
            }
        }
        if let Some(cooperative) = active(&self.cooperative) {
            if record.cooperative_code != cooperative {
                return false;
            }
        }
        if let Some(variety) = active(&self.variety) {
            if record.variety != variety {
                return false;
            }
        }
        if let Some(needle) = active(&self.sub_lot_contains) {
            if !record.sub_lot_code.contains(needle) {
                return false;
            }
        }
        if let Some(needle) = active(&self.buyer_contains) {
            if !record.buyer_code.contains(needle) {
                return false;
            }
        }
        if self.date_from.is_some_and(|from| record.trade_date < from) {
            return false;
        }
        if self.date_to.is_some_and(|to| record.trade_date > to) {
            return false;
        }
        true
    }

    pub fn apply<'a>(&self, records: &'a [TransactionRecord]) -> Vec<&'a TransactionRecord> {
        records.iter().filter(|r| self.matches(r)).collect()
    }

    pub fn is_empty(&self) -> bool {
        active(&self.market).is_none()
            && active(&self.cooperative).is_none()
            && active(&self.variety).is_none()
            && active(&self.sub_lot_contains).is_none()
            && active(&self.buyer_contains).is_none()
            && self.date_from.is_none()
            && self.date_to.is_none()
    }
}

/// Sort newest trade first, then highest unit price.
pub fn sort_for_display(records: &mut [TransactionRecord]) {
    records.sort_by(|a, b| {
        b.trade_date
            .cmp(&a.trade_date)
            .then(b.unit_price.cmp(&a.unit_price))
    });
}

/// Record row with pre-formatted display fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayRecord {
    #[serde(flatten)]
    pub record: TransactionRecord,
    pub date_text: String,
    pub minguo_date_text: String,
    pub grade_label: String,
    pub variety_label: String,
    pub cooperative_label: String,
}

impl From<&TransactionRecord> for DisplayRecord {
    fn from(record: &TransactionRecord) -> Self {
        Self {
            date_text: record.trade_date.format("%Y-%m-%d").to_string(),
            minguo_date_text: format_minguo(record.trade_date),
            grade_label: record.grade.label(),
            variety_label: record.variety_label(),
            cooperative_label: record.cooperative_label(),
            record: record.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub records: usize,
    pub total_pieces: u64,
    pub total_weight_kg: u64,
    pub total_value: u64,
    pub min_unit_price: Option<u64>,
    pub max_unit_price: Option<u64>,
    /// Total value over total weight; zero when no weight was traded.
    pub average_unit_price: f64,
}

impl Summary {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a TransactionRecord>) -> Self {
        let mut summary = Summary::default();
        for record in records {
            summary.records += 1;
            summary.total_pieces += record.piece_count;
            summary.total_weight_kg += record.weight_kg;
            summary.total_value += record.total_value;
            summary.min_unit_price = Some(
                summary
                    .min_unit_price
                    .map_or(record.unit_price, |p| p.min(record.unit_price)),
            );
            summary.max_unit_price = Some(
                summary
                    .max_unit_price
                    .map_or(record.unit_price, |p| p.max(record.unit_price)),
            );
        }
        summary.average_unit_price = if summary.total_weight_kg > 0 {
            summary.total_value as f64 / summary.total_weight_kg as f64
        } else {
            0.0
        };
        summary
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacetCount {
    pub value: String,
    pub label: String,
    pub count: usize,
}

/// Distinct filter values with their record counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Facets {
    pub markets: Vec<FacetCount>,
    pub cooperatives: Vec<FacetCount>,
    pub varieties: Vec<FacetCount>,
}

impl Facets {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a TransactionRecord>) -> Self {
        let mut markets = BTreeMap::<String, (String, usize)>::new();
        let mut cooperatives = BTreeMap::<String, (String, usize)>::new();
        let mut varieties = BTreeMap::<String, (String, usize)>::new();
        for record in records {
            markets
                .entry(record.market.clone())
                .or_insert_with(|| (record.market.clone(), 0))
                .1 += 1;
            cooperatives
                .entry(record.cooperative_code.clone())
                .or_insert_with(|| (record.cooperative_label(), 0))
                .1 += 1;
            varieties
                .entry(record.variety.clone())
                .or_insert_with(|| (record.variety_label(), 0))
                .1 += 1;
        }
        let flatten = |map: BTreeMap<String, (String, usize)>| {
            map.into_iter()
                .map(|(value, (label, count))| FacetCount { value, label, count })
                .collect::<Vec<_>>()
        };
        Facets {
            markets: flatten(markets),
            cooperatives: flatten(cooperatives),
            varieties: flatten(varieties),
        }
    }
}
