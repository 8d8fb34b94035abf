//! Run reports: markdown brief, JSON dump, parquet snapshot + manifest.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use amis_core::{DisplayRecord, Summary, TransactionRecord};
use anyhow::{Context, Result};
use arrow_array::{Date32Array, RecordBatch, StringArray, UInt64Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Datelike, Utc};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use uuid::Uuid;

use crate::{CollectStats, FileReport};

pub const DAILY_BRIEF_FILE: &str = "daily_brief.md";
pub const TRANSACTIONS_FILE: &str = "transactions.json";
pub const SNAPSHOT_DIR: &str = "snapshots";
pub const MANIFEST_FILE: &str = "manifest.json";

/// Days from 0001-01-01 (CE day 1) to 1970-01-01.
const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMeta {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Serialize)]
struct TransactionsDump<'a> {
    run: &'a RunMeta,
    stats: &'a CollectStats,
    summary: Summary,
    files: &'a [FileReport],
    records: Vec<DisplayRecord>,
}

pub fn render_daily_brief(run: &RunMeta, stats: &CollectStats, records: &[TransactionRecord]) -> String {
    let summary = Summary::from_records(records);
    let mut per_market: BTreeMap<&str, (usize, u64)> = BTreeMap::new();
    for r in records {
        let entry = per_market.entry(r.market.as_str()).or_default();
        entry.0 += 1;
        entry.1 += r.total_value;
    }
    let price_range = match (summary.min_unit_price, summary.max_unit_price) {
        (Some(min), Some(max)) => format!("{min} - {max}"),
        _ => "n/a".to_string(),
    };

    let mut lines = vec![
        "# AMIS Settlement Brief".to_string(),
        String::new(),
        format!("- Run ID: `{}`", run.run_id),
        format!("- Started: {}", run.started_at),
        format!("- Finished: {}", run.finished_at),
        format!(
            "- Sources: {} enabled, {} unreachable",
            stats.enabled_sources, stats.failed_sources
        ),
        format!("- Files: {} fetched, {} failed", stats.files, stats.failed_files),
        format!(
            "- Records: {} unique ({} extracted, {} duplicates, {} malformed blocks skipped)",
            records.len(),
            stats.extracted_records,
            stats.duplicates,
            stats.skipped_blocks
        ),
        String::new(),
        "## Totals".to_string(),
        format!("- Pieces: {}", summary.total_pieces),
        format!("- Weight (kg): {}", summary.total_weight_kg),
        format!("- Value: {}", summary.total_value),
        format!("- Unit price range: {price_range}"),
        format!("- Average unit price: {:.1}", summary.average_unit_price),
        String::new(),
        "## Markets".to_string(),
    ];
    if per_market.is_empty() {
        lines.push("- no data".to_string());
    }
    for (market, (count, value)) in per_market {
        lines.push(format!("- {market}: {count} records, value {value}"));
    }
    lines.push(String::new());
    lines.join("\n")
}

pub async fn write_reports(
    reports_dir: &Path,
    run: &RunMeta,
    stats: &CollectStats,
    files: &[FileReport],
    records: &[TransactionRecord],
) -> Result<()> {
    fs::create_dir_all(reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    fs::write(
        reports_dir.join(DAILY_BRIEF_FILE),
        render_daily_brief(run, stats, records),
    )
    .await
    .context("writing daily_brief.md")?;

    let dump = TransactionsDump {
        run,
        stats,
        summary: Summary::from_records(records),
        files,
        records: records.iter().map(DisplayRecord::from).collect(),
    };
    let json = serde_json::to_vec_pretty(&dump).context("serializing transactions dump")?;
    fs::write(reports_dir.join(TRANSACTIONS_FILE), json)
        .await
        .context("writing transactions.json")?;
    Ok(())
}

pub async fn export_parquet_snapshot(reports_dir: &Path, records: &[TransactionRecord]) -> Result<PathBuf> {
    let snapshot_dir = reports_dir.join(SNAPSHOT_DIR);
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let transactions_path = snapshot_dir.join("transactions.parquet");
    write_transactions_parquet(&transactions_path, records)?;

    let manifest = ParquetManifest {
        schema_version: 1,
        files: vec![manifest_entry("transactions", reports_dir, &transactions_path)?],
    };
    let manifest_path = snapshot_dir.join(MANIFEST_FILE);
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn utf8_column<'a>(records: &'a [TransactionRecord], f: impl Fn(&'a TransactionRecord) -> &'a str) -> StringArray {
    StringArray::from(records.iter().map(|r| Some(f(r))).collect::<Vec<_>>())
}

fn u64_column(records: &[TransactionRecord], f: impl Fn(&TransactionRecord) -> u64) -> UInt64Array {
    UInt64Array::from(records.iter().map(f).collect::<Vec<_>>())
}

fn write_transactions_parquet(path: &Path, records: &[TransactionRecord]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("serial_id", DataType::Utf8, false),
        ArrowField::new("trade_date", DataType::Date32, false),
        ArrowField::new("grade", DataType::Utf8, false),
        ArrowField::new("market_code", DataType::Utf8, false),
        ArrowField::new("market", DataType::Utf8, false),
        ArrowField::new("cooperative_code", DataType::Utf8, false),
        ArrowField::new("sub_lot_code", DataType::Utf8, false),
        ArrowField::new("variety", DataType::Utf8, false),
        ArrowField::new("piece_count", DataType::UInt64, false),
        ArrowField::new("weight_kg", DataType::UInt64, false),
        ArrowField::new("unit_price", DataType::UInt64, false),
        ArrowField::new("total_value", DataType::UInt64, false),
        ArrowField::new("buyer_code", DataType::Utf8, false),
    ]));

    let trade_dates = Date32Array::from(
        records
            .iter()
            .map(|r| r.trade_date.num_days_from_ce() - UNIX_EPOCH_DAYS_FROM_CE)
            .collect::<Vec<_>>(),
    );

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(utf8_column(records, |r| r.serial_id.as_str())),
            Arc::new(trade_dates),
            Arc::new(utf8_column(records, |r| r.grade.code())),
            Arc::new(utf8_column(records, |r| r.market_code.as_str())),
            Arc::new(utf8_column(records, |r| r.market.as_str())),
            Arc::new(utf8_column(records, |r| r.cooperative_code.as_str())),
            Arc::new(utf8_column(records, |r| r.sub_lot_code.as_str())),
            Arc::new(utf8_column(records, |r| r.variety.as_str())),
            Arc::new(u64_column(records, |r| r.piece_count)),
            Arc::new(u64_column(records, |r| r.weight_kg)),
            Arc::new(u64_column(records, |r| r.unit_price)),
            Arc::new(u64_column(records, |r| r.total_value)),
            Arc::new(utf8_column(records, |r| r.buyer_code.as_str())),
        ],
    )
    .context("building transactions record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, reports_dir: &Path, path: &Path) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let rel = path
        .strip_prefix(reports_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        sha256: hex::encode(hasher.finalize()),
        bytes: bytes.len() as u64,
    })
}

/// Markdown digest of the most recent `runs` report directories under `<root>/reports`.
pub fn report_daily_markdown(runs: usize, workspace_root: Option<PathBuf>) -> Result<String> {
    let root = workspace_root.unwrap_or_else(|| PathBuf::from("."));
    let reports_root = root.join("reports");
    let mut dirs = std::fs::read_dir(&reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .filter_map(|entry| {
            let dump = read_dump_header(&entry.path().join(TRANSACTIONS_FILE)).ok()?;
            Some((entry.path(), dump))
        })
        .collect::<Vec<_>>();
    dirs.sort_by_key(|(_, dump)| dump.run.started_at);
    dirs.reverse();

    let mut lines = vec!["# AMIS Report Digest".to_string(), String::new()];
    if dirs.is_empty() {
        lines.push("No completed runs found.".to_string());
    }
    for (dir, dump) in dirs.into_iter().take(runs.max(1)) {
        let manifest_path = dir.join(SNAPSHOT_DIR).join(MANIFEST_FILE);
        lines.push(format!("## Run `{}`", dump.run.run_id));
        lines.push(format!("- finished: {}", dump.run.finished_at));
        lines.push(format!("- records: {}", dump.records.len()));
        lines.push(format!("- value: {}", dump.summary.total_value));
        lines.push(format!("- failed files: {}", dump.stats.failed_files));
        lines.push(format!("- brief: `{}`", dir.join(DAILY_BRIEF_FILE).display()));
        if manifest_path.exists() {
            lines.push(format!("- parquet manifest: `{}`", manifest_path.display()));
        }
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}

#[derive(Deserialize)]
struct DumpHeader {
    run: RunMeta,
    stats: CollectStats,
    summary: Summary,
    records: Vec<serde_json::Value>,
}

fn read_dump_header(path: &Path) -> Result<DumpHeader> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use amis_core::Grade;
    use chrono::{NaiveDate, TimeZone};
    use tempfile::tempdir;

    fn sample_records() -> Vec<TransactionRecord> {
        vec![TransactionRecord {
            serial_id: "A".to_string(),
            trade_date: NaiveDate::from_ymd_opt(2026, 2, 10).unwrap(),
            grade: Grade::Premium,
            market_code: "S0".to_string(),
            market: "高雄縣".to_string(),
            cooperative_code: "S00076".to_string(),
            sub_lot_code: "001".to_string(),
            variety: "R1".to_string(),
            piece_count: 3,
            weight_kg: 18,
            unit_price: 140,
            total_value: 252,
            buyer_code: "6000".to_string(),
        }]
    }

    fn run_meta() -> RunMeta {
        let at = Utc.with_ymd_and_hms(2026, 2, 10, 7, 0, 0).single().unwrap();
        RunMeta {
            run_id: Uuid::new_v4(),
            started_at: at,
            finished_at: at,
        }
    }

    #[test]
    fn brief_lists_totals_and_markets() {
        let stats = CollectStats {
            enabled_sources: 1,
            files: 1,
            extracted_records: 2,
            duplicates: 1,
            ..Default::default()
        };
        let brief = render_daily_brief(&run_meta(), &stats, &sample_records());
        assert!(brief.contains("- Records: 1 unique (2 extracted, 1 duplicates"));
        assert!(brief.contains("- Unit price range: 140 - 140"));
        assert!(brief.contains("- 高雄縣: 1 records, value 252"));
    }

    #[test]
    fn brief_handles_empty_runs() {
        let brief = render_daily_brief(&run_meta(), &CollectStats::default(), &[]);
        assert!(brief.contains("- Unit price range: n/a"));
        assert!(brief.contains("- no data"));
    }

    #[test]
    fn epoch_offset_matches_chrono() {
        let epoch = NaiveDate::from_ymd_opt(1970, 1, 1).unwrap();
        assert_eq!(epoch.num_days_from_ce(), UNIX_EPOCH_DAYS_FROM_CE);
    }

    #[tokio::test]
    async fn reports_and_snapshot_are_written_and_digested() {
        let root = tempdir().unwrap();
        let run = run_meta();
        let reports_dir = root.path().join("reports").join(run.run_id.to_string());
        let records = sample_records();

        write_reports(&reports_dir, &run, &CollectStats::default(), &[], &records)
            .await
            .unwrap();
        let manifest_path = export_parquet_snapshot(&reports_dir, &records).await.unwrap();

        let manifest: ParquetManifest =
            serde_json::from_slice(&std::fs::read(&manifest_path).unwrap()).unwrap();
        assert_eq!(manifest.files.len(), 1);
        assert_eq!(manifest.files[0].path, "snapshots/transactions.parquet");
        assert_eq!(manifest.files[0].sha256.len(), 64);
        assert!(manifest.files[0].bytes > 0);

        let digest = report_daily_markdown(5, Some(root.path().to_path_buf())).unwrap();
        assert!(digest.contains(&run.run_id.to_string()));
        assert!(digest.contains("- records: 1"));
        assert!(digest.contains("- value: 252"));
    }
}
