//! Report persistence: Parquet and JSON sinks, the sha256 manifest and the run brief.
//!
//! Basket columns differ between tables of one batch, so the Parquet output
//! is split in two files with fixed schemas. `comparison.parquet` holds one
//! row per product with the attribution and metadata columns, and
//! `basket_prices.parquet` holds the per-basket prices in long form
//! (`product`, `basket`, `price`). Pivoting the second on `basket` gives the
//! one-column-per-basket view; `comparison.json` carries it directly.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{Float64Array, RecordBatch, StringArray, UInt32Array, UInt64Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use parquet::arrow::ArrowWriter;
use pbc_core::AggregateRow;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::info;

use crate::config::{OutputFormat, RunSettings};
use crate::ComparisonReport;

pub const MANIFEST_SCHEMA_VERSION: u32 = 1;

/// Writes one representation of a report into the run directory.
pub trait TableSink: Send + Sync {
    fn name(&self) -> &'static str;

    /// Returns the files written, as `(manifest name, path)` pairs.
    fn write(&self, dir: &Path, report: &ComparisonReport) -> Result<Vec<(String, PathBuf)>>;
}

#[derive(Debug, Default)]
pub struct ParquetSink;

impl TableSink for ParquetSink {
    fn name(&self) -> &'static str {
        "parquet"
    }

    fn write(&self, dir: &Path, report: &ComparisonReport) -> Result<Vec<(String, PathBuf)>> {
        let comparison_path = dir.join("comparison.parquet");
        let prices_path = dir.join("basket_prices.parquet");
        write_comparison_parquet(&comparison_path, report)?;
        write_basket_prices_parquet(&prices_path, report)?;
        Ok(vec![
            ("comparison".to_string(), comparison_path),
            ("basket_prices".to_string(), prices_path),
        ])
    }
}

#[derive(Debug, Default)]
pub struct JsonSink;

impl TableSink for JsonSink {
    fn name(&self) -> &'static str {
        "json"
    }

    fn write(&self, dir: &Path, report: &ComparisonReport) -> Result<Vec<(String, PathBuf)>> {
        let path = dir.join("comparison.json");
        let bytes = serde_json::to_vec_pretty(report).context("serializing comparison report")?;
        std::fs::write(&path, bytes).with_context(|| format!("writing {}", path.display()))?;
        Ok(vec![("comparison_json".to_string(), path)])
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportManifest {
    pub schema_version: u32,
    pub batch_id: String,
    pub files: Vec<ManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone)]
pub struct WrittenReport {
    pub dir: PathBuf,
    pub manifest: PathBuf,
    pub brief: PathBuf,
    pub files: Vec<ManifestFile>,
}

/// Lays a report out under `<output_dir>/<YYYYmmdd_HHMMSS>_<batch_id>/`.
pub struct ReportWriter {
    output_dir: PathBuf,
    sinks: Vec<Box<dyn TableSink>>,
}

impl ReportWriter {
    pub fn new(output_dir: impl Into<PathBuf>, format: OutputFormat) -> Self {
        let mut sinks: Vec<Box<dyn TableSink>> = Vec::new();
        if format.parquet() {
            sinks.push(Box::new(ParquetSink));
        }
        if format.json() {
            sinks.push(Box::new(JsonSink));
        }
        Self {
            output_dir: output_dir.into(),
            sinks,
        }
    }

    pub fn from_settings(settings: &RunSettings) -> Self {
        Self::new(settings.output_dir.clone(), settings.output_format)
    }

    pub fn with_sink(mut self, sink: Box<dyn TableSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn run_dir(&self, report: &ComparisonReport) -> PathBuf {
        self.output_dir.join(format!(
            "{}_{}",
            report.started_at.format("%Y%m%d_%H%M%S"),
            report.batch_id
        ))
    }

    pub async fn write(&self, report: &ComparisonReport) -> Result<WrittenReport> {
        let dir = self.run_dir(report);
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;

        let mut files = Vec::new();
        for sink in &self.sinks {
            for (name, path) in sink
                .write(&dir, report)
                .with_context(|| format!("{} sink", sink.name()))?
            {
                files.push(manifest_entry(&name, &dir, &path)?);
            }
        }

        let brief = dir.join("brief.md");
        fs::write(&brief, render_brief(report))
            .await
            .context("writing brief.md")?;
        files.push(manifest_entry("brief", &dir, &brief)?);

        let manifest = ReportManifest {
            schema_version: MANIFEST_SCHEMA_VERSION,
            batch_id: report.batch_id.to_string(),
            files: files.clone(),
        };
        let manifest_path = dir.join("manifest.json");
        let bytes = serde_json::to_vec_pretty(&manifest).context("serializing report manifest")?;
        fs::write(&manifest_path, bytes)
            .await
            .with_context(|| format!("writing {}", manifest_path.display()))?;

        info!(dir = %dir.display(), files = files.len(), "report written");
        Ok(WrittenReport {
            dir,
            manifest: manifest_path,
            brief,
            files,
        })
    }
}

pub fn render_brief(report: &ComparisonReport) -> String {
    let mut lines = vec![
        "# Price Comparison Brief".to_string(),
        String::new(),
        format!("- Batch ID: `{}`", report.batch_id),
        format!("- Started: {}", report.started_at.to_rfc3339()),
        format!("- Targets: {}", report.tables.len()),
        format!("- Rows: {}", report.rows().count()),
        format!("- Failed fetches: {}", report.failures.len()),
        String::new(),
        "## Targets".to_string(),
        String::new(),
        "| title | timestamp | status | rows | baskets | missing | issue |".to_string(),
        "|---|---|---|---|---|---|---|".to_string(),
    ];
    for table in &report.tables {
        lines.push(format!(
            "| {} | {} | {} | {} | {} | {} | {} |",
            table.title(),
            table.timestamp().to_rfc3339(),
            table.status(),
            table.rows().len(),
            table.basket_columns().len(),
            table
                .missing()
                .iter()
                .map(|k| k.as_str())
                .collect::<Vec<_>>()
                .join(", "),
            table.issue().map(|i| format!("{i:?}")).unwrap_or_default(),
        ));
    }

    if !report.failures.is_empty() {
        lines.push(String::new());
        lines.push("## Failures".to_string());
        lines.push(String::new());
        for f in &report.failures {
            lines.push(format!(
                "- [{}] `{}` ({:?}): {}",
                f.target, f.failure.locator, f.failure.kind, f.failure.message
            ));
        }
    }
    lines.push(String::new());
    lines.join("\n")
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

fn write_comparison_parquet(path: &Path, report: &ComparisonReport) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("title", DataType::Utf8, false),
        ArrowField::new("timestamp", DataType::Utf8, false),
        ArrowField::new("status", DataType::Utf8, false),
        ArrowField::new("product", DataType::Utf8, false),
        ArrowField::new("brand", DataType::Utf8, true),
        ArrowField::new("category", DataType::Utf8, true),
        ArrowField::new("product_id", DataType::UInt64, true),
        ArrowField::new("review_count", DataType::UInt32, true),
        ArrowField::new("cheapest_shop", DataType::Utf8, false),
        ArrowField::new("cheapest_price", DataType::Float64, false),
        ArrowField::new("most_expensive_shop", DataType::Utf8, false),
        ArrowField::new("most_expensive_price", DataType::Float64, false),
    ]));

    let rows: Vec<&AggregateRow> = report.rows().collect();
    let titles = StringArray::from(rows.iter().map(|r| Some(r.title.as_str())).collect::<Vec<_>>());
    let timestamps = StringArray::from(
        rows.iter()
            .map(|r| Some(r.timestamp.to_rfc3339()))
            .collect::<Vec<_>>(),
    );
    let statuses =
        StringArray::from(rows.iter().map(|r| Some(r.status.as_str())).collect::<Vec<_>>());
    let products = StringArray::from(rows.iter().map(|r| Some(r.key.as_str())).collect::<Vec<_>>());
    let brands = StringArray::from(rows.iter().map(|r| r.brand.as_deref()).collect::<Vec<_>>());
    let categories =
        StringArray::from(rows.iter().map(|r| r.category.as_deref()).collect::<Vec<_>>());
    let product_ids = UInt64Array::from(rows.iter().map(|r| r.product_id).collect::<Vec<_>>());
    let reviews = UInt32Array::from(rows.iter().map(|r| r.review_count).collect::<Vec<_>>());
    let cheapest_shops = StringArray::from(
        rows.iter()
            .map(|r| Some(r.cheapest_shop.as_str()))
            .collect::<Vec<_>>(),
    );
    let cheapest_prices =
        Float64Array::from(rows.iter().map(|r| r.cheapest_price).collect::<Vec<_>>());
    let dear_shops = StringArray::from(
        rows.iter()
            .map(|r| Some(r.most_expensive_shop.as_str()))
            .collect::<Vec<_>>(),
    );
    let dear_prices =
        Float64Array::from(rows.iter().map(|r| r.most_expensive_price).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(titles),
            Arc::new(timestamps),
            Arc::new(statuses),
            Arc::new(products),
            Arc::new(brands),
            Arc::new(categories),
            Arc::new(product_ids),
            Arc::new(reviews),
            Arc::new(cheapest_shops),
            Arc::new(cheapest_prices),
            Arc::new(dear_shops),
            Arc::new(dear_prices),
        ],
    )
    .context("building comparison record batch")?;
    write_parquet(path, batch)
}

/// One row per product and basket column; a basket without an offer gets a null price.
fn write_basket_prices_parquet(path: &Path, report: &ComparisonReport) -> Result<()> {
    let rows = report
        .rows()
        .flat_map(|r| {
            r.prices
                .iter()
                .map(move |(basket, price)| (r, basket.as_str(), *price))
        })
        .collect::<Vec<_>>();

    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("title", DataType::Utf8, false),
        ArrowField::new("timestamp", DataType::Utf8, false),
        ArrowField::new("product", DataType::Utf8, false),
        ArrowField::new("basket", DataType::Utf8, false),
        ArrowField::new("price", DataType::Float64, true),
    ]));
    let titles = StringArray::from(
        rows.iter()
            .map(|(r, _, _)| Some(r.title.as_str()))
            .collect::<Vec<_>>(),
    );
    let timestamps = StringArray::from(
        rows.iter()
            .map(|(r, _, _)| Some(r.timestamp.to_rfc3339()))
            .collect::<Vec<_>>(),
    );
    let products = StringArray::from(
        rows.iter()
            .map(|(r, _, _)| Some(r.key.as_str()))
            .collect::<Vec<_>>(),
    );
    let baskets = StringArray::from(rows.iter().map(|(_, b, _)| Some(*b)).collect::<Vec<_>>());
    let prices = Float64Array::from(rows.iter().map(|(_, _, p)| *p).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(titles),
            Arc::new(timestamps),
            Arc::new(products),
            Arc::new(baskets),
            Arc::new(prices),
        ],
    )
    .context("building basket_prices record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, run_dir: &Path, path: &Path) -> Result<ManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path
        .strip_prefix(run_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::{FailureKind, FetchFailure};
    use crate::reconcile::Reconciler;
    use crate::TargetFailure;
    use chrono::Utc;
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
    use pbc_core::{AggregateTable, AggregationIssue, Basket, Offer, RunStamp};
    use uuid::Uuid;

    fn report() -> ComparisonReport {
        let mut shop1 = Basket::new("shop1");
        shop1.add(Offer::priced("A", 10.0).brand(Some("MSI".into())).build().unwrap());
        let mut shop2 = Basket::new("shop2");
        shop2.add(Offer::priced("A", 12.0).build().unwrap());
        shop2.add(Offer::priced("B", 5.0).product_id(Some(9)).build().unwrap());
        let table = Reconciler::default().reconcile(&[shop1, shop2], RunStamp::now("GPUs"), None);
        let failed = AggregateTable::placeholder(
            RunStamp::now("Monitors"),
            AggregationIssue::TargetFailed("all 1 locators failed".into()),
        );
        ComparisonReport {
            batch_id: Uuid::new_v4(),
            started_at: Utc::now(),
            tables: vec![table, failed],
            failures: vec![TargetFailure {
                target: "Monitors".into(),
                failure: FetchFailure {
                    index: 0,
                    locator: "https://shop.test/monitors".into(),
                    kind: FailureKind::Fetch,
                    message: "http status 503".into(),
                },
            }],
        }
    }

    fn parquet_rows(path: &Path) -> usize {
        let file = File::open(path).unwrap();
        ParquetRecordBatchReaderBuilder::try_new(file)
            .unwrap()
            .build()
            .unwrap()
            .map(|b| b.unwrap().num_rows())
            .sum()
    }

    #[tokio::test]
    async fn writes_all_outputs_with_matching_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let report = report();
        let written = ReportWriter::new(dir.path(), OutputFormat::Both)
            .write(&report)
            .await
            .unwrap();

        assert!(written.dir.starts_with(dir.path()));
        assert!(written
            .dir
            .file_name()
            .unwrap()
            .to_string_lossy()
            .ends_with(&report.batch_id.to_string()));

        let names: Vec<&str> = written.files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["comparison", "basket_prices", "comparison_json", "brief"]);
        for file in &written.files {
            let bytes = std::fs::read(written.dir.join(&file.path)).unwrap();
            assert_eq!(bytes.len() as u64, file.bytes);
            assert_eq!(hex::encode(Sha256::digest(&bytes)), file.sha256);
        }

        let manifest: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&written.manifest).unwrap()).unwrap();
        assert_eq!(manifest["files"].as_array().unwrap().len(), 4);

        assert_eq!(parquet_rows(&written.dir.join("comparison.parquet")), 2);
        // two products x two basket columns, absent prices included
        assert_eq!(parquet_rows(&written.dir.join("basket_prices.parquet")), 4);
    }

    #[tokio::test]
    async fn json_only_output_skips_parquet() {
        let dir = tempfile::tempdir().unwrap();
        let written = ReportWriter::new(dir.path(), OutputFormat::Json)
            .write(&report())
            .await
            .unwrap();
        assert!(!written.dir.join("comparison.parquet").exists());

        let raw = std::fs::read(written.dir.join("comparison.json")).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        let rows = json["tables"][0]["rows"].as_array().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["prices"]["shop1"], 10.0);
        assert!(rows[1]["prices"]["shop1"].is_null());
        assert_eq!(json["tables"][1]["issue"]["kind"], "target_failed");
    }

    fn parquet_columns(path: &Path) -> Vec<String> {
        let file = File::open(path).unwrap();
        let builder = ParquetRecordBatchReaderBuilder::try_new(file).unwrap();
        builder.schema().fields().iter().map(|f| f.name().clone()).collect()
    }

    #[tokio::test]
    async fn basket_prices_live_in_the_long_format_file() {
        let dir = tempfile::tempdir().unwrap();
        let written = ReportWriter::new(dir.path(), OutputFormat::Parquet)
            .write(&report())
            .await
            .unwrap();

        let summary = parquet_columns(&written.dir.join("comparison.parquet"));
        assert!(summary.contains(&"cheapest_shop".to_string()));
        assert!(!summary.iter().any(|c| c == "shop1" || c == "shop2"));
        let long = parquet_columns(&written.dir.join("basket_prices.parquet"));
        assert_eq!(long, ["title", "timestamp", "product", "basket", "price"]);
    }

    #[test]
    fn brief_lists_targets_and_failures() {
        let brief = render_brief(&report());
        assert!(brief.contains("| GPUs |"));
        assert!(brief.contains("| Monitors |"));
        assert!(brief.contains("- Rows: 2"));
        assert!(brief.contains("https://shop.test/monitors"));
    }
}
