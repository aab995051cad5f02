//! Bounded worker pool
//!
//! Dispatches tasks to a [`TaskExecutor`] with at most N invocations in
//! flight, gated by a tokio Semaphore. Each task is dispatched at most once.
//! Successful outcomes are recorded in the completion ledger from the worker
//! itself, immediately after the download finishes. An optional progress bar
//! advances once per finished task.

use crate::executor::TaskExecutor;
use crate::ledger::{CompletionLedger, LedgerError};
use crate::report::Report;
use crate::task::{Outcome, OutcomeStatus, Task};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Fatal pool errors. Per-task failures never show up here.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("Worker task panicked: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// What happened to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolRun {
    /// Tasks handed to the executor.
    pub dispatched: usize,
    /// Tasks still queued when dispatching stopped.
    pub remaining: usize,
    /// Dispatching stopped early because of cancellation.
    pub cancelled: bool,
}

pub struct WorkerPool {
    concurrency: usize,
    executor: Arc<dyn TaskExecutor>,
    ledger: Option<Arc<CompletionLedger>>,
    report: Report,
    progress: ProgressBar,
}

/// Overall bar drawn on stderr while a batch runs.
pub fn batch_progress_bar() -> ProgressBar {
    let pb = ProgressBar::new(0);
    if let Ok(style) = ProgressStyle::default_bar()
        .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
    {
        pb.set_style(style.progress_chars("█▉▊▋▌▍▎▏  "));
    }
    pb
}

/// One line per finished task, printed above the bar.
pub fn progress_line(outcome: &Outcome) -> String {
    match outcome.status {
        OutcomeStatus::Success => format!("✓ {}", outcome.url()),
        OutcomeStatus::Skipped => format!("- {}", outcome.url()),
        OutcomeStatus::Failed => format!(
            "✗ {}: {}",
            outcome.url(),
            outcome.error_reason.as_deref().unwrap_or("failed")
        ),
    }
}

impl WorkerPool {
    /// `concurrency` below 1 is treated as 1.
    pub fn new(
        concurrency: usize,
        executor: Arc<dyn TaskExecutor>,
        ledger: Option<Arc<CompletionLedger>>,
        report: Report,
    ) -> Self {
        Self {
            concurrency: concurrency.max(1),
            executor,
            ledger,
            report,
            progress: ProgressBar::hidden(),
        }
    }

    /// Drive `bar` while running; its length is set to the number of tasks.
    pub fn with_progress(mut self, bar: ProgressBar) -> Self {
        self.progress = bar;
        self
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Run every task, returning once all dispatched work has finished.
    ///
    /// Cancelling `cancel` stops dispatch before the next task; in-flight
    /// executions observe the same token. A ledger write failure also stops
    /// dispatch and is returned once the in-flight work has drained.
    pub async fn run(
        &self,
        tasks: Vec<Task>,
        cancel: &CancellationToken,
    ) -> Result<PoolRun, PoolError> {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let stop = cancel.child_token();
        let mut queue: VecDeque<Task> = tasks.into();
        let mut workers: JoinSet<Result<(), PoolError>> = JoinSet::new();
        let mut dispatched = 0usize;
        self.progress.set_length(queue.len() as u64);

        info!(
            tasks = queue.len(),
            concurrency = self.concurrency,
            "dispatching tasks"
        );

        while !queue.is_empty() {
            let permit = tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            // cancellation may have landed while we waited for the permit
            if stop.is_cancelled() {
                break;
            }
            let Some(task) = queue.pop_front() else {
                break;
            };

            dispatched += 1;
            debug!(url = %task.source_url, dispatched, "task dispatched");

            let executor = self.executor.clone();
            let ledger = self.ledger.clone();
            let report = self.report.clone();
            let progress = self.progress.clone();
            let stop = stop.clone();
            workers.spawn(async move {
                let _permit = permit;
                progress.set_message(task.source_url.clone());
                let outcome = executor.execute(&task, &stop).await;
                let recorded = record_completion(ledger, &outcome).await;
                report.record(&outcome).await;
                progress.println(progress_line(&outcome));
                progress.inc(1);
                if let Err(e) = &recorded {
                    error!(error = %e, "ledger write failed, stopping dispatch");
                    stop.cancel();
                }
                recorded
            });
        }

        let mut fatal: Option<PoolError> = None;
        while let Some(joined) = workers.join_next().await {
            let result = match joined {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e,
                Err(e) => PoolError::Join(e),
            };
            stop.cancel();
            fatal.get_or_insert(result);
        }

        if let Some(err) = fatal {
            self.progress.abandon();
            return Err(err);
        }
        self.progress.finish_and_clear();

        let run = PoolRun {
            dispatched,
            remaining: queue.len(),
            cancelled: cancel.is_cancelled(),
        };
        info!(
            dispatched = run.dispatched,
            remaining = run.remaining,
            cancelled = run.cancelled,
            "worker pool drained"
        );
        Ok(run)
    }
}

async fn record_completion(
    ledger: Option<Arc<CompletionLedger>>,
    outcome: &Outcome,
) -> Result<(), PoolError> {
    let (Some(ledger), true) = (ledger, outcome.is_success()) else {
        return Ok(());
    };
    let Some(id) = outcome.item_id.clone() else {
        debug!(url = %outcome.url(), "no item id reported, ledger not updated");
        return Ok(());
    };
    // each append is synced to disk
    tokio::task::spawn_blocking(move || ledger.record(&id)).await??;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::classify;
    use crate::task::{FailureKind, OutcomeStatus, TaskOptions};
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Executor that tracks how many calls overlap.
    #[derive(Default)]
    struct CountingExecutor {
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        calls: Mutex<Vec<String>>,
        delay_ms: u64,
    }

    impl CountingExecutor {
        fn with_delay(delay_ms: u64) -> Self {
            Self {
                delay_ms,
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl TaskExecutor for CountingExecutor {
        async fn execute(&self, task: &Task, cancel: &CancellationToken) -> Outcome {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            self.calls.lock().unwrap().push(task.source_url.clone());

            let outcome = tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(self.delay_ms)) => {
                    Outcome::success(task.clone(), None, None)
                }
                _ = cancel.cancelled() => {
                    Outcome::failed(task.clone(), FailureKind::Interrupted, "interrupted")
                }
            };

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            outcome
        }
    }

    fn tasks(n: usize) -> Vec<Task> {
        let options = TaskOptions {
            quality: Default::default(),
            output_dir: PathBuf::from("downloads"),
            cookie_source: Default::default(),
            rate_limit: None,
        };
        (0..n)
            .map(|i| {
                Task::new(
                    classify(&format!("https://vk.com/video1_{}", i)).unwrap(),
                    &options,
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn test_never_exceeds_concurrency_limit() {
        let executor = Arc::new(CountingExecutor::with_delay(20));
        let report = Report::new();
        let pool = WorkerPool::new(3, executor.clone(), None, report.clone());

        let run = pool.run(tasks(12), &CancellationToken::new()).await.unwrap();

        assert_eq!(run.dispatched, 12);
        assert_eq!(run.remaining, 0);
        assert!(!run.cancelled);
        assert!(executor.max_in_flight.load(Ordering::SeqCst) <= 3);
        assert!(executor.max_in_flight.load(Ordering::SeqCst) >= 2);
        assert_eq!(report.summary().await.succeeded, 12);
    }

    #[tokio::test]
    async fn test_every_task_attempted_exactly_once() {
        let executor = Arc::new(CountingExecutor::with_delay(1));
        let pool = WorkerPool::new(4, executor.clone(), None, Report::new());

        pool.run(tasks(25), &CancellationToken::new()).await.unwrap();

        let mut calls = executor.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 25);
        calls.sort();
        calls.dedup();
        assert_eq!(calls.len(), 25);
    }

    #[tokio::test]
    async fn test_zero_concurrency_is_one_worker() {
        let executor = Arc::new(CountingExecutor::with_delay(5));
        let pool = WorkerPool::new(0, executor.clone(), None, Report::new());
        assert_eq!(pool.concurrency(), 1);

        pool.run(tasks(4), &CancellationToken::new()).await.unwrap();
        assert_eq!(executor.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_successes_recorded_in_ledger() {
        let dir = TempDir::new().unwrap();
        let ledger = Arc::new(CompletionLedger::load(dir.path().join("downloaded.txt")).unwrap());
        let executor = Arc::new(CountingExecutor::with_delay(1));
        let pool = WorkerPool::new(2, executor, Some(ledger.clone()), Report::new());

        pool.run(tasks(5), &CancellationToken::new()).await.unwrap();

        assert_eq!(ledger.len(), 5);
        for i in 0..5 {
            assert!(ledger.contains(&format!("1_{}", i)));
        }
    }

    #[tokio::test]
    async fn test_cancellation_stops_dispatch() {
        let executor = Arc::new(CountingExecutor::with_delay(200));
        let report = Report::new();
        let pool = WorkerPool::new(2, executor.clone(), None, report.clone());
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let run = pool.run(tasks(10), &cancel).await.unwrap();

        assert!(run.cancelled);
        assert_eq!(run.dispatched, 2);
        assert_eq!(run.remaining, 8);

        let summary = report.summary().await;
        assert_eq!(summary.total, run.dispatched);
        assert_eq!(summary.failed, 2);
        assert_eq!(executor.calls.lock().unwrap().len(), 2);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_ledger_failure_is_fatal() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("downloaded.txt");
        let ledger = Arc::new(CompletionLedger::load(&path).unwrap());
        // a directory where the ledger file should be makes every append fail
        std::fs::create_dir(&path).unwrap();

        let executor = Arc::new(CountingExecutor::with_delay(1));
        let pool = WorkerPool::new(1, executor.clone(), Some(ledger), Report::new());

        let err = pool
            .run(tasks(6), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::Ledger(_)));
        assert!(executor.calls.lock().unwrap().len() < 6);
    }

    #[tokio::test]
    async fn test_progress_advances_per_dispatched_task() {
        let executor = Arc::new(CountingExecutor::with_delay(200));
        let bar = ProgressBar::hidden();
        let pool = WorkerPool::new(2, executor, None, Report::new()).with_progress(bar.clone());
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let run = pool.run(tasks(7), &cancel).await.unwrap();

        assert_eq!(bar.length(), Some(7));
        assert_eq!(bar.position(), run.dispatched as u64);
        assert!(bar.is_finished());
    }

    #[test]
    fn test_progress_line_per_status() {
        let mut all = tasks(3).into_iter();
        let ok = Outcome::success(all.next().unwrap(), None, None);
        let skip = Outcome::skipped(all.next().unwrap(), "already downloaded");
        let fail = Outcome::failed(all.next().unwrap(), FailureKind::Mux, "ERROR: Postprocessing");

        assert_eq!(progress_line(&ok), "✓ https://vk.com/video1_0");
        assert_eq!(progress_line(&skip), "- https://vk.com/video1_1");
        assert_eq!(progress_line(&fail), "✗ https://vk.com/video1_2: ERROR: Postprocessing");
    }

    #[tokio::test]
    async fn test_failed_outcomes_not_recorded() {
        struct FailingExecutor;

        #[async_trait]
        impl TaskExecutor for FailingExecutor {
            async fn execute(&self, task: &Task, _cancel: &CancellationToken) -> Outcome {
                Outcome::failed(task.clone(), FailureKind::Extraction, "ERROR: private")
            }
        }

        let dir = TempDir::new().unwrap();
        let ledger = Arc::new(CompletionLedger::load(dir.path().join("downloaded.txt")).unwrap());
        let report = Report::new();
        let pool = WorkerPool::new(2, Arc::new(FailingExecutor), Some(ledger.clone()), report.clone());

        pool.run(tasks(3), &CancellationToken::new()).await.unwrap();

        assert!(ledger.is_empty());
        let records = report.records().await;
        assert!(records.iter().all(|r| r.status == OutcomeStatus::Failed));
    }
}
