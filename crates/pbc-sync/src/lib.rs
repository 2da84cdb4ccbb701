//! Run pipeline: fetch fan-out, basket population, reconciliation and report output.

mod config;
mod export;
mod orchestrator;
mod reconcile;
#[cfg(test)]
mod testing;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use pbc_adapters::{reader_for_shape, PageExtract, ReadContext, SourceReader};
use pbc_core::{
    expected_keys, AggregateRow, AggregateTable, AggregationIssue, Basket, IdentityPolicy,
    ProductKey, RunStamp,
};
use pbc_storage::{ArtifactStore, BackoffPolicy, HttpClientConfig, HttpFetcher, PageLoader};
use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub use config::{ConfigError, OutputFormat, RunSettings, TargetConfig, TargetRegistry};
pub use export::{
    render_brief, JsonSink, ManifestFile, ParquetSink, ReportManifest, ReportWriter, TableSink,
    WrittenReport,
};
pub use orchestrator::{
    FailureKind, FetchFailure, FetchOrchestrator, FetchOutcome, InFlight, DEFAULT_CONCURRENCY,
};
pub use reconcile::Reconciler;

pub const CRATE_NAME: &str = "pbc-sync";

/// A fetch failure, tagged with the target it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetFailure {
    pub target: String,
    pub failure: FetchFailure,
}

/// Every table a batch produced, plus every per-locator failure.
#[derive(Debug, Clone, Serialize)]
pub struct ComparisonReport {
    pub batch_id: Uuid,
    pub started_at: DateTime<Utc>,
    /// Sorted by run timestamp.
    pub tables: Vec<AggregateTable>,
    pub failures: Vec<TargetFailure>,
}

impl ComparisonReport {
    /// Rows of every table, concatenated in table order.
    pub fn rows(&self) -> impl Iterator<Item = &AggregateRow> {
        self.tables.iter().flat_map(|t| t.rows().iter())
    }

    pub fn is_empty(&self) -> bool {
        self.tables.iter().all(AggregateTable::is_empty)
    }
}

struct TargetRun {
    table: AggregateTable,
    failures: Vec<FetchFailure>,
}

pub struct RunController {
    loader: PageLoader,
    orchestrator: FetchOrchestrator,
    reconciler: Reconciler,
    identity: IdentityPolicy,
    reader: Option<Arc<dyn SourceReader>>,
}

impl RunController {
    pub fn new(settings: &RunSettings) -> Result<Self> {
        settings.validate()?;

        let http = HttpFetcher::new(HttpClientConfig {
            timeout: settings.http_timeout,
            user_agent: Some(settings.user_agent.clone()),
            backoff: BackoffPolicy {
                max_retries: settings.http_retries,
                ..BackoffPolicy::default()
            },
        })?;
        let mut loader = PageLoader::new(http);
        if let Some(dir) = &settings.archive_dir {
            loader = loader.with_archive(ArtifactStore::new(dir.clone()));
        }

        Ok(Self {
            loader,
            orchestrator: FetchOrchestrator::new(settings.concurrency_cap)
                .with_task_timeout(settings.task_timeout),
            reconciler: Reconciler::new(settings.identity),
            identity: settings.identity,
            reader: None,
        })
    }

    /// Use `reader` for every target instead of picking one by page shape.
    pub fn with_reader(mut self, reader: Arc<dyn SourceReader>) -> Self {
        self.reader = Some(reader);
        self
    }

    pub fn concurrency_cap(&self) -> usize {
        self.orchestrator.concurrency_cap()
    }

    pub async fn run_target(&self, target: &TargetConfig) -> Result<ComparisonReport, ConfigError> {
        self.run_batch(&TargetRegistry::single(target.clone())).await
    }

    /// Targets run one after another. A target whose every fetch failed
    /// contributes an empty placeholder table; the batch carries on.
    pub async fn run_batch(
        &self,
        registry: &TargetRegistry,
    ) -> Result<ComparisonReport, ConfigError> {
        registry.validate()?;

        let batch_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%batch_id, targets = registry.targets.len(), "batch started");

        let mut tables = Vec::with_capacity(registry.targets.len());
        let mut failures = Vec::new();
        for target in &registry.targets {
            let run = self.execute(target).await;
            let label = run.table.title().to_string();
            failures.extend(run.failures.into_iter().map(|failure| TargetFailure {
                target: label.clone(),
                failure,
            }));
            tables.push(run.table);
        }
        tables.sort_by_key(AggregateTable::timestamp);

        let report = ComparisonReport {
            batch_id,
            started_at,
            tables,
            failures,
        };
        info!(
            %batch_id,
            rows = report.rows().count(),
            failures = report.failures.len(),
            "batch finished"
        );
        Ok(report)
    }

    async fn execute(&self, target: &TargetConfig) -> TargetRun {
        let label = target.label();
        let ctx = ReadContext {
            run_id: Uuid::new_v4(),
            target: label.clone(),
        };
        let reader = self
            .reader
            .clone()
            .unwrap_or_else(|| reader_for_shape(target.shape, self.loader.clone()));
        let span = info_span!(
            "run",
            run_id = %ctx.run_id,
            target = %label,
            reader = reader.reader_id()
        );

        async move {
            let in_flight = self.orchestrator.dispatch(reader, &ctx, &target.locators);
            let timestamp = Utc::now();
            let outcome = in_flight.collect().await;

            let title = target
                .title
                .clone()
                .or_else(|| first_title(&outcome.extracts))
                .unwrap_or_else(|| label.clone());
            let stamp = RunStamp {
                run_id: ctx.run_id,
                timestamp,
                title,
            };

            if outcome.is_total_failure() {
                warn!(
                    locators = target.locators.len(),
                    "every fetch failed; emitting placeholder table"
                );
                let issue = AggregationIssue::TargetFailed(format!(
                    "all {} locators failed",
                    target.locators.len()
                ));
                return TargetRun {
                    table: AggregateTable::placeholder(stamp, issue),
                    failures: outcome.failures,
                };
            }

            let expected = self.expected_set(target, &outcome.extracts);
            let baskets = populate_baskets(outcome.extracts);
            TargetRun {
                table: self.reconciler.reconcile(&baskets, stamp, expected.as_ref()),
                failures: outcome.failures,
            }
        }
        .instrument(span)
        .await
    }

    /// Configured products win; otherwise the union of what the pages report.
    /// `None` when neither is available.
    fn expected_set(
        &self,
        target: &TargetConfig,
        extracts: &[PageExtract],
    ) -> Option<BTreeSet<ProductKey>> {
        if let Some(products) = &target.expected_products {
            return Some(expected_keys(products, self.identity));
        }
        let mut reported = extracts.iter().filter_map(|e| e.expected.as_ref()).peekable();
        reported.peek()?;
        Some(reported.flat_map(|refs| expected_keys(refs, self.identity)).collect())
    }
}

fn first_title(extracts: &[PageExtract]) -> Option<String> {
    extracts
        .iter()
        .filter_map(|e| e.title.as_deref())
        .map(str::trim)
        .find(|t| !t.is_empty())
        .map(str::to_string)
}

/// Extracts arrive in locator order; each record lands in its basket in that order.
fn populate_baskets(extracts: Vec<PageExtract>) -> Vec<Basket> {
    let mut baskets: BTreeMap<String, Basket> = BTreeMap::new();
    for extract in extracts {
        for record in extract.records {
            baskets
                .entry(record.basket.clone())
                .or_insert_with(|| Basket::new(record.basket))
                .add(record.offer);
        }
    }
    baskets.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{record, ScriptedReader};
    use pbc_adapters::PageShape;
    use pbc_core::CompletenessStatus;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn controller(reader: Arc<ScriptedReader>) -> RunController {
        RunController::new(&RunSettings::default())
            .unwrap()
            .with_reader(reader)
    }

    fn target(title: &str, locators: &[&str]) -> TargetConfig {
        TargetConfig::new(
            PageShape::Json,
            locators.iter().map(|l| l.to_string()).collect(),
        )
        .with_title(title)
    }

    #[tokio::test]
    async fn single_target_end_to_end() {
        let reader = Arc::new(
            ScriptedReader::default()
                .page("https://a.test/1", vec![record("shop1", "A", 10.0)])
                .page(
                    "https://a.test/2",
                    vec![record("shop2", "A", 12.0), record("shop2", "B", 5.0)],
                )
                .page("https://a.test/3", vec![record("shop3", "B", 5.0)])
                .expect("https://a.test/1", &["A", "B"])
                .staggered(
                    &["https://a.test/1".to_string(), "https://a.test/2".to_string()],
                    Duration::from_millis(5),
                ),
        );
        let report = controller(reader)
            .run_target(&target(
                "GPUs",
                &["https://a.test/1", "https://a.test/2", "https://a.test/3"],
            ))
            .await
            .unwrap();

        assert_eq!(report.tables.len(), 1);
        let table = &report.tables[0];
        assert_eq!(table.title(), "GPUs");
        assert_eq!(table.status(), CompletenessStatus::Complete);
        assert_eq!(table.basket_columns(), ["shop1", "shop2", "shop3"]);

        let a = table.row("A").unwrap();
        assert_eq!(a.cheapest_shop, "shop1");
        assert_eq!(a.most_expensive_shop, "shop2");
        assert_eq!(a.prices["shop3"], None);
        let b = table.row("B").unwrap();
        assert_eq!((b.cheapest_shop.as_str(), b.cheapest_price), ("shop2", 5.0));

        let stamps: BTreeSet<_> = report.rows().map(|r| r.timestamp).collect();
        assert_eq!(stamps.len(), 1);
        assert!(report.failures.is_empty());
    }

    #[tokio::test]
    async fn partial_failures_still_produce_a_table() {
        let reader = Arc::new(
            ScriptedReader::default()
                .page("https://a.test/1", vec![record("shop1", "A", 10.0)])
                .fail("https://a.test/2")
                .expect("https://a.test/1", &["A", "Z"]),
        );
        let report = controller(reader)
            .run_target(&target("GPUs", &["https://a.test/1", "https://a.test/2"]))
            .await
            .unwrap();

        let table = &report.tables[0];
        assert_eq!(table.rows().len(), 1);
        assert_eq!(table.status(), CompletenessStatus::MissingProducts);
        assert_eq!(table.missing(), [ProductKey::new("Z")]);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].target, "GPUs");
        assert_eq!(report.failures[0].failure.locator, "https://a.test/2");
    }

    #[tokio::test]
    async fn failed_target_becomes_placeholder_and_batch_continues() {
        let down_pages = ["https://down.test/1", "https://down.test/2"];
        let reader = Arc::new(
            ScriptedReader::default()
                .fail_all(&down_pages.map(String::from))
                .page("https://up.test/1", vec![record("shop1", "A", 3.0)]),
        );
        let registry = TargetRegistry {
            targets: vec![
                target("Down", &down_pages),
                target("Up", &["https://up.test/1"]),
            ],
        };
        let report = controller(reader).run_batch(&registry).await.unwrap();

        assert_eq!(report.tables.len(), 2);
        assert!(report.tables[0].timestamp() <= report.tables[1].timestamp());
        let down = report.tables.iter().find(|t| t.title() == "Down").unwrap();
        assert!(down.is_empty());
        assert!(matches!(down.issue(), Some(AggregationIssue::TargetFailed(_))));
        let up = report.tables.iter().find(|t| t.title() == "Up").unwrap();
        assert_eq!(up.rows().len(), 1);
        assert_eq!(report.rows().count(), 1);
        assert_eq!(report.failures.len(), 2);
    }

    #[tokio::test]
    async fn configuration_errors_prevent_any_dispatch() {
        let reader = Arc::new(ScriptedReader::default());
        let controller = controller(reader.clone());

        let bad = target("Bad", &["https://ok.test/1", "not a url"]);
        assert!(matches!(
            controller.run_target(&bad).await,
            Err(ConfigError::InvalidLocator { .. })
        ));
        assert!(matches!(
            controller.run_batch(&TargetRegistry { targets: vec![] }).await,
            Err(ConfigError::NoTargets)
        ));
        assert_eq!(reader.calls.load(Ordering::SeqCst), 0);

        let settings = RunSettings {
            concurrency_cap: 0,
            ..RunSettings::default()
        };
        assert!(RunController::new(&settings).is_err());
    }

    #[tokio::test]
    async fn page_title_and_expected_set_fill_gaps_in_config() {
        let reader = Arc::new(
            ScriptedReader::default()
                .title("https://a.test/1", "Karty graficzne")
                .expect("https://a.test/1", &["https://a.test/1"]),
        );
        let untitled = TargetConfig::new(PageShape::Summary, vec!["https://a.test/1".into()]);
        let report = controller(reader.clone()).run_target(&untitled).await.unwrap();
        assert_eq!(report.tables[0].title(), "Karty graficzne");
        assert_eq!(report.tables[0].status(), CompletenessStatus::Complete);

        let mut overridden = untitled.clone();
        overridden.expected_products = Some(vec![pbc_core::ProductRef {
            name: Some("Other".into()),
            product_id: None,
        }]);
        let report = controller(reader).run_target(&overridden).await.unwrap();
        assert_eq!(report.tables[0].status(), CompletenessStatus::MissingProducts);
    }

    #[tokio::test]
    async fn no_expected_set_means_unknown_status() {
        let reader = Arc::new(ScriptedReader::default());
        let report = controller(reader)
            .run_target(&target("t", &["https://a.test/1"]))
            .await
            .unwrap();
        assert_eq!(report.tables[0].status(), CompletenessStatus::Unknown);
        assert_eq!(report.tables[0].rows().len(), 1);
    }
}
