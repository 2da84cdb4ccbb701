//! Bounded-concurrency fan-out of source reads with per-task failure isolation.

use std::sync::Arc;
use std::time::Duration;

use pbc_adapters::{PageExtract, ReadContext, ReaderError, SourceReader};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, info_span, warn, Instrument};

pub const DEFAULT_CONCURRENCY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Fetch,
    Parse,
    Extract,
    Timeout,
    Panicked,
}

/// A locator whose read failed, and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FetchFailure {
    pub index: usize,
    pub locator: String,
    pub kind: FailureKind,
    pub message: String,
}

#[derive(Debug)]
enum TaskError {
    Reader(ReaderError),
    Timeout(Duration),
    Panicked(String),
}

impl TaskError {
    fn into_failure(self, index: usize, locator: String) -> FetchFailure {
        let (kind, message) = match self {
            TaskError::Reader(err) => {
                let kind = match &err {
                    ReaderError::Fetch(_) => FailureKind::Fetch,
                    ReaderError::Parse(_) | ReaderError::Json(_) => FailureKind::Parse,
                    ReaderError::Markup(_) | ReaderError::Message(_) => FailureKind::Extract,
                };
                (kind, err.to_string())
            }
            TaskError::Timeout(limit) => (
                FailureKind::Timeout,
                format!("no response within {}ms", limit.as_millis()),
            ),
            TaskError::Panicked(msg) => (FailureKind::Panicked, msg),
        };
        FetchFailure {
            index,
            locator,
            kind,
            message,
        }
    }
}

/// Successful extracts and failures, both in locator order.
#[derive(Debug, Default)]
pub struct FetchOutcome {
    pub extracts: Vec<PageExtract>,
    pub failures: Vec<FetchFailure>,
}

impl FetchOutcome {
    pub fn is_total_failure(&self) -> bool {
        self.extracts.is_empty() && !self.failures.is_empty()
    }
}

type TaskReport = (usize, Result<PageExtract, TaskError>);

/// Reads already dispatched to the worker pool.
pub struct InFlight {
    tasks: JoinSet<TaskReport>,
    locators: Vec<String>,
}

impl InFlight {
    /// Wait for every task. Results are keyed by locator index, so
    /// completion order never shows in the outcome.
    pub async fn collect(mut self) -> FetchOutcome {
        let mut slots: Vec<Option<Result<PageExtract, TaskError>>> =
            (0..self.locators.len()).map(|_| None).collect();

        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok((index, result)) => slots[index] = Some(result),
                Err(err) => warn!(error = %err, "fetch worker aborted"),
            }
        }

        let mut outcome = FetchOutcome::default();
        for (index, (slot, locator)) in slots.into_iter().zip(self.locators).enumerate() {
            match slot {
                Some(Ok(extract)) => outcome.extracts.push(extract),
                Some(Err(err)) => {
                    let failure = err.into_failure(index, locator);
                    warn!(
                        locator = %failure.locator,
                        kind = ?failure.kind,
                        error = %failure.message,
                        "fetch task failed"
                    );
                    outcome.failures.push(failure);
                }
                None => outcome.failures.push(
                    TaskError::Panicked("worker exited without reporting".to_string())
                        .into_failure(index, locator),
                ),
            }
        }

        info!(
            succeeded = outcome.extracts.len(),
            failed = outcome.failures.len(),
            "fetch batch complete"
        );
        outcome
    }
}

#[derive(Debug, Clone)]
pub struct FetchOrchestrator {
    concurrency_cap: usize,
    task_timeout: Option<Duration>,
}

impl Default for FetchOrchestrator {
    fn default() -> Self {
        Self::new(DEFAULT_CONCURRENCY)
    }
}

impl FetchOrchestrator {
    pub fn new(concurrency_cap: usize) -> Self {
        Self {
            concurrency_cap: concurrency_cap.max(1),
            task_timeout: None,
        }
    }

    pub fn with_task_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.task_timeout = timeout;
        self
    }

    pub fn concurrency_cap(&self) -> usize {
        self.concurrency_cap
    }

    /// Spawn one read per locator; at most `concurrency_cap` run at once.
    /// Must be called from within a tokio runtime.
    pub fn dispatch(
        &self,
        reader: Arc<dyn SourceReader>,
        ctx: &ReadContext,
        locators: &[String],
    ) -> InFlight {
        let permits = Arc::new(Semaphore::new(self.concurrency_cap));
        let mut tasks = JoinSet::new();

        for (index, locator) in locators.iter().enumerate() {
            let permits = Arc::clone(&permits);
            let reader = Arc::clone(&reader);
            let ctx = ctx.clone();
            let locator = locator.clone();
            let timeout = self.task_timeout;
            let span = info_span!("fetch_task", run_id = %ctx.run_id, index, locator = %locator);

            tasks.spawn(
                async move {
                    let result = match permits.acquire_owned().await {
                        Ok(_permit) => run_read(reader, ctx, locator, timeout).await,
                        Err(_) => Err(TaskError::Panicked("worker pool closed".to_string())),
                    };
                    (index, result)
                }
                .instrument(span),
            );
        }

        debug!(tasks = locators.len(), cap = self.concurrency_cap, "fetch tasks dispatched");
        InFlight {
            tasks,
            locators: locators.to_vec(),
        }
    }

    pub async fn fetch_all(
        &self,
        reader: Arc<dyn SourceReader>,
        ctx: &ReadContext,
        locators: &[String],
    ) -> FetchOutcome {
        self.dispatch(reader, ctx, locators).collect().await
    }
}

/// The read runs in its own task so a panic or a timeout stays contained.
async fn run_read(
    reader: Arc<dyn SourceReader>,
    ctx: ReadContext,
    locator: String,
    timeout: Option<Duration>,
) -> Result<PageExtract, TaskError> {
    let mut handle = tokio::spawn(async move { reader.read(&ctx, &locator).await });

    let joined = match timeout {
        Some(limit) => match tokio::time::timeout(limit, &mut handle).await {
            Ok(joined) => joined,
            Err(_) => {
                handle.abort();
                return Err(TaskError::Timeout(limit));
            }
        },
        None => handle.await,
    };

    match joined {
        Ok(Ok(extract)) => Ok(extract),
        Ok(Err(err)) => Err(TaskError::Reader(err)),
        Err(err) => Err(TaskError::Panicked(err.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ctx, ScriptedReader};
    use std::sync::atomic::Ordering;

    fn locators(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("https://shop.test/p/{i}")).collect()
    }

    #[tokio::test]
    async fn returns_n_minus_k_successes_and_k_failures() {
        let locs = locators(10);
        let reader = ScriptedReader::default()
            .fail(&locs[1])
            .fail(&locs[4])
            .fail(&locs[9])
            .staggered(&locs, Duration::from_millis(5));
        let outcome = FetchOrchestrator::new(4)
            .fetch_all(Arc::new(reader), &ctx(), &locs)
            .await;

        assert_eq!(outcome.extracts.len(), 7);
        assert_eq!(outcome.failures.len(), 3);
        let failed: Vec<usize> = outcome.failures.iter().map(|f| f.index).collect();
        assert_eq!(failed, vec![1, 4, 9]);
        assert!(outcome.failures.iter().all(|f| f.kind == FailureKind::Extract));
    }

    #[tokio::test]
    async fn outcome_is_invariant_under_completion_order() {
        let locs = locators(8);
        let forward = ScriptedReader::default()
            .fail(&locs[2])
            .staggered(&locs, Duration::from_millis(4));
        let mut reversed_locs = locs.clone();
        reversed_locs.reverse();
        let backward = ScriptedReader::default()
            .fail(&locs[2])
            .staggered(&reversed_locs, Duration::from_millis(4));

        let orchestrator = FetchOrchestrator::new(8);
        let a = orchestrator.fetch_all(Arc::new(forward), &ctx(), &locs).await;
        let b = orchestrator.fetch_all(Arc::new(backward), &ctx(), &locs).await;

        let order = |o: &FetchOutcome| {
            o.extracts.iter().map(|e| e.locator.clone()).collect::<Vec<_>>()
        };
        assert_eq!(order(&a), order(&b));
        assert_eq!(order(&a), {
            let mut expected = locs.clone();
            expected.remove(2);
            expected
        });
        assert_eq!(a.failures, b.failures);
    }

    #[tokio::test]
    async fn never_exceeds_concurrency_cap() {
        let locs = locators(12);
        let reader = Arc::new(ScriptedReader::default().staggered(&locs, Duration::from_millis(3)));
        let outcome = FetchOrchestrator::new(3)
            .fetch_all(reader.clone(), &ctx(), &locs)
            .await;

        assert_eq!(outcome.extracts.len(), 12);
        let peak = reader.peak.load(Ordering::SeqCst);
        assert!(peak <= 3, "peak concurrency {peak} exceeded cap");
        assert!(peak >= 2, "reads never overlapped");
    }

    #[tokio::test]
    async fn slow_reads_time_out_without_blocking_siblings() {
        let locs = locators(3);
        let reader = ScriptedReader::default().delay(&locs[0], Duration::from_secs(30));
        let outcome = FetchOrchestrator::new(3)
            .with_task_timeout(Some(Duration::from_millis(50)))
            .fetch_all(Arc::new(reader), &ctx(), &locs)
            .await;

        assert_eq!(outcome.extracts.len(), 2);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].kind, FailureKind::Timeout);
        assert_eq!(outcome.failures[0].locator, locs[0]);
    }

    #[tokio::test]
    async fn panicking_read_is_recorded_not_propagated() {
        let locs = locators(4);
        let reader = ScriptedReader::default().panic_on(&locs[3]);
        let outcome = FetchOrchestrator::new(2)
            .fetch_all(Arc::new(reader), &ctx(), &locs)
            .await;

        assert_eq!(outcome.extracts.len(), 3);
        assert_eq!(outcome.failures[0].kind, FailureKind::Panicked);
        assert_eq!(outcome.failures[0].index, 3);
    }

    #[tokio::test]
    async fn total_failure_is_flagged() {
        let locs = locators(2);
        let reader = ScriptedReader::default().fail(&locs[0]).fail(&locs[1]);
        let outcome = FetchOrchestrator::default()
            .fetch_all(Arc::new(reader), &ctx(), &locs)
            .await;
        assert!(outcome.is_total_failure());

        let empty = FetchOrchestrator::default()
            .fetch_all(Arc::new(ScriptedReader::default()), &ctx(), &[])
            .await;
        assert!(!empty.is_total_failure());
        assert!(empty.extracts.is_empty());
    }
}
