//! Batch controller
//!
//! Runs the sequential planning phase (classification, container enumeration,
//! de-duplication, ledger filtering), hands the resulting tasks to the worker
//! pool and collects the report. Dry-run and format listing share the same
//! input handling but never download.

use crate::classify::{classify, extract_item_id, read_list_file, ClassifiedUrl, UrlKind};
use crate::concurrency::resolve_concurrency;
use crate::config::{Config, ConfigError};
use crate::executor::{DownloadExecutor, TaskExecutor};
use crate::extractor::{ExtractError, MediaExtractor, YtDlp, YtDlpSettings};
use crate::ledger::{CompletionLedger, LedgerError};
use crate::pool::{batch_progress_bar, PoolError, WorkerPool};
use crate::report::{render_summary, Report, ReportRecord, RunSummary};
use crate::startup::PreflightError;
use crate::task::{FailureKind, Outcome, Task, TaskOptions};
use std::borrow::Cow;
use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tabled::settings::object::Columns;
use tabled::settings::{Modify, Style, Width};
use tabled::{Table, Tabled};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Longest title shown in the dry-run table before it is cut.
const TITLE_WIDTH: usize = 50;

/// Errors that abort a whole run.
#[derive(Debug, Error)]
pub enum BatchError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Pre-flight check failed: {0}")]
    Preflight(#[from] PreflightError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Worker task panicked: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl From<PoolError> for BatchError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Ledger(e) => BatchError::Ledger(e),
            PoolError::Join(e) => BatchError::Join(e),
        }
    }
}

/// Gather inputs from positional URLs and an optional list file.
///
/// Positional URLs come first, then list-file lines in file order. Exact
/// duplicates are dropped, keeping the first occurrence.
pub fn collect_inputs(urls: &[String], list_file: Option<&Path>) -> Result<Vec<String>, ConfigError> {
    let mut inputs: Vec<String> = urls
        .iter()
        .map(|u| u.trim().to_string())
        .filter(|u| !u.is_empty())
        .collect();

    if let Some(path) = list_file {
        let lines = read_list_file(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        inputs.extend(lines);
    }

    let mut seen = HashSet::new();
    inputs.retain(|u| seen.insert(u.clone()));

    if inputs.is_empty() {
        return Err(ConfigError::Invalid(
            "no URLs given; pass URLs as arguments or use -f FILE".to_string(),
        ));
    }
    Ok(inputs)
}

/// Result of the planning phase.
#[derive(Debug, Default)]
pub struct Plan {
    /// Tasks to dispatch, in input order.
    pub tasks: Vec<Task>,
    /// Outcomes decided without a download: ledger hits, unusable inputs,
    /// failed enumerations.
    pub settled: Vec<Outcome>,
    /// Planning stopped early because of cancellation.
    pub cancelled: bool,
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Clean,
    Failures,
    Interrupted,
}

/// Everything a finished run produced.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub summary: RunSummary,
    pub records: Vec<ReportRecord>,
    pub cancelled: bool,
    pub dispatched: usize,
    pub log_path: Option<PathBuf>,
}

impl RunOutcome {
    pub fn status(&self) -> RunStatus {
        if self.cancelled {
            RunStatus::Interrupted
        } else if self.summary.has_failures() {
            RunStatus::Failures
        } else {
            RunStatus::Clean
        }
    }

    pub fn render(&self) -> String {
        render_summary(&self.records, &self.summary)
    }
}

/// One row of the dry-run table.
#[derive(Debug, Clone, PartialEq)]
pub struct DryRunEntry {
    pub url: String,
    pub title: Option<String>,
    pub duration_secs: Option<f64>,
    pub archived: bool,
    pub error: Option<String>,
}

/// Format listing for one input.
#[derive(Debug)]
pub struct FormatListing {
    pub url: String,
    pub result: Result<String, ExtractError>,
}

pub struct BatchController {
    options: TaskOptions,
    concurrency: usize,
    archive_filter: bool,
    logs_dir: PathBuf,
    extractor: Arc<dyn MediaExtractor>,
    executor: Arc<dyn TaskExecutor>,
    ledger: Arc<CompletionLedger>,
    show_progress: bool,
}

impl BatchController {
    pub fn new(
        config: &Config,
        extractor: Arc<dyn MediaExtractor>,
        executor: Arc<dyn TaskExecutor>,
        ledger: Arc<CompletionLedger>,
    ) -> Self {
        Self {
            options: TaskOptions::from_config(config),
            concurrency: resolve_concurrency(config.download.max_concurrent),
            archive_filter: config.archive.enabled,
            logs_dir: config.logging.logs_dir.clone(),
            extractor,
            executor,
            ledger,
            show_progress: false,
        }
    }

    /// Draw a progress bar on stderr during [`BatchController::run`].
    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    /// Wire up yt-dlp and load the ledger named in the configuration.
    pub fn from_config(config: &Config) -> Result<Self, BatchError> {
        let settings = YtDlpSettings::from_config(config);
        let ledger = Arc::new(CompletionLedger::load(&config.archive.file)?);
        Ok(Self::new(
            config,
            Arc::new(YtDlp::new(settings.clone())),
            Arc::new(DownloadExecutor::new(settings)),
            ledger,
        ))
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn options(&self) -> &TaskOptions {
        &self.options
    }

    pub fn ledger(&self) -> &CompletionLedger {
        &self.ledger
    }

    fn unusable(&self, input: &str, reason: String) -> Outcome {
        let task = Task::new(
            ClassifiedUrl {
                url: input.to_string(),
                kind: UrlKind::Unknown,
                item_id: None,
            },
            &self.options,
        );
        Outcome::skipped(task, reason)
    }

    /// Classify, enumerate, de-duplicate and ledger-filter the inputs.
    pub async fn plan(&self, inputs: &[String], cancel: &CancellationToken) -> Plan {
        let mut plan = Plan::default();
        let mut seen: HashSet<String> = HashSet::new();

        for input in inputs {
            if cancel.is_cancelled() {
                plan.cancelled = true;
                break;
            }

            let classified = match classify(input) {
                Ok(c) => c,
                Err(e) => {
                    warn!(input = %input, error = %e, "skipping unusable input");
                    plan.settled.push(self.unusable(input, e.to_string()));
                    continue;
                }
            };

            if classified.kind.is_container() {
                match self.expand_container(&classified, cancel).await {
                    Ok(members) => {
                        info!(
                            url = %classified.url,
                            kind = %classified.kind,
                            members = members.len(),
                            "container enumerated"
                        );
                        for member in members {
                            self.admit(member, &mut seen, &mut plan);
                        }
                    }
                    Err(e) => {
                        let task = Task::new(classified, &self.options);
                        if matches!(e, ExtractError::Interrupted) {
                            plan.cancelled = true;
                            break;
                        }
                        warn!(url = %task.source_url, error = %e, "enumeration failed");
                        plan.settled.push(Outcome::failed(
                            task,
                            FailureKind::Enumeration,
                            format!("enumeration failed: {}", e),
                        ));
                    }
                }
            } else {
                let mut classified = classified;
                if classified.kind == UrlKind::Unknown {
                    warn!(url = %classified.url, "unrecognized URL, passing to yt-dlp unverified");
                    if self.archive_filter {
                        match self.resolve_item_id(&classified.url, cancel).await {
                            Ok(id) => classified.item_id = id,
                            Err(ExtractError::Interrupted) => {
                                plan.cancelled = true;
                                break;
                            }
                            Err(e) => {
                                debug!(url = %classified.url, error = %e, "could not resolve item id")
                            }
                        }
                    }
                }
                self.admit(classified, &mut seen, &mut plan);
            }
        }

        info!(
            tasks = plan.tasks.len(),
            settled = plan.settled.len(),
            "planning finished"
        );
        plan
    }

    /// Consume a container's member stream to the end. Any error discards the
    /// members collected so far.
    async fn expand_container(
        &self,
        container: &ClassifiedUrl,
        cancel: &CancellationToken,
    ) -> Result<Vec<ClassifiedUrl>, ExtractError> {
        let mut stream = self
            .extractor
            .enumerate(&container.url, &self.options.cookie_source)
            .await?;

        let mut members = Vec::new();
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ExtractError::Interrupted),
                next = stream.next_member() => next?,
            };
            let Some(url) = next else {
                break;
            };
            match classify(&url) {
                Ok(member) => members.push(member),
                Err(e) => debug!(member = %url, error = %e, "ignoring unusable container member"),
            }
        }
        Ok(members)
    }

    /// Ask yt-dlp for the id of a URL the classifier could not key, so the
    /// ledger can be checked before it is downloaded again. Anything other
    /// than a single entry with an id resolves to `None`.
    async fn resolve_item_id(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, ExtractError> {
        let probed = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ExtractError::Interrupted),
            probed = self.extractor.probe(url, &self.options.cookie_source) => probed?,
        };
        Ok(match probed.as_slice() {
            [single] => single.id.clone(),
            _ => None,
        })
    }

    fn admit(&self, classified: ClassifiedUrl, seen: &mut HashSet<String>, plan: &mut Plan) {
        if !seen.insert(classified.dedupe_key().to_string()) {
            debug!(url = %classified.url, "duplicate task dropped");
            return;
        }

        let task = Task::new(classified, &self.options);
        let archived = self.archive_filter
            && task
                .item_id
                .as_deref()
                .is_some_and(|id| self.ledger.contains(id));

        if archived {
            debug!(url = %task.source_url, "already in ledger");
            plan.settled.push(Outcome::skipped(task, "already downloaded"));
        } else {
            plan.tasks.push(task);
        }
    }

    /// Plan, download and report.
    ///
    /// Per-task failures end up in the summary; only ledger I/O errors and
    /// worker panics are returned as `Err`.
    pub async fn run(
        &self,
        inputs: &[String],
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, BatchError> {
        let report = Report::new();
        info!(run_id = %report.run_id(), inputs = inputs.len(), "run started");

        let plan = self.plan(inputs, cancel).await;
        for outcome in &plan.settled {
            report.record(outcome).await;
        }

        let mut pool = WorkerPool::new(
            self.concurrency,
            self.executor.clone(),
            Some(self.ledger.clone()),
            report.clone(),
        );
        if self.show_progress {
            pool = pool.with_progress(batch_progress_bar());
        }
        let pool_run = pool.run(plan.tasks, cancel).await?;

        let log_path = match report.write_log(&self.logs_dir).await {
            Ok(path) => Some(path),
            Err(e) => {
                warn!(dir = %self.logs_dir.display(), error = %e, "could not write run log");
                None
            }
        };

        let outcome = RunOutcome {
            summary: report.summary().await,
            records: report.records().await,
            cancelled: plan.cancelled || pool_run.cancelled,
            dispatched: pool_run.dispatched,
            log_path,
        };
        info!(
            succeeded = outcome.summary.succeeded,
            skipped = outcome.summary.skipped,
            failed = outcome.summary.failed,
            cancelled = outcome.cancelled,
            "run finished"
        );
        Ok(outcome)
    }

    /// Probe every input without downloading.
    pub async fn dry_run(&self, inputs: &[String], cancel: &CancellationToken) -> Vec<DryRunEntry> {
        let mut entries = Vec::new();
        for input in inputs {
            if cancel.is_cancelled() {
                break;
            }
            let url = match classify(input) {
                Ok(c) => c.url,
                Err(e) => {
                    entries.push(DryRunEntry::error(input, e.to_string()));
                    continue;
                }
            };

            match self.extractor.probe(&url, &self.options.cookie_source).await {
                Ok(probed) => entries.extend(probed.into_iter().map(|p| {
                    let item_id = extract_item_id(&p.url).or(p.id);
                    DryRunEntry {
                        archived: item_id.is_some_and(|id| self.ledger.contains(&id)),
                        url: p.url,
                        title: p.title,
                        duration_secs: p.duration_secs,
                        error: None,
                    }
                })),
                Err(e) => {
                    warn!(url = %url, error = %e, "probe failed");
                    entries.push(DryRunEntry::error(&url, e.to_string()));
                }
            }
        }
        entries
    }

    /// Fetch the yt-dlp format table of every input.
    pub async fn list_formats(&self, inputs: &[String]) -> Vec<FormatListing> {
        let mut listings = Vec::new();
        for input in inputs {
            let url = classify(input).map(|c| c.url).unwrap_or_else(|_| input.clone());
            let result = self
                .extractor
                .list_formats(&url, &self.options.cookie_source)
                .await;
            listings.push(FormatListing { url, result });
        }
        listings
    }
}

impl DryRunEntry {
    fn error(url: &str, reason: String) -> Self {
        Self {
            url: url.to_string(),
            title: None,
            duration_secs: None,
            archived: false,
            error: Some(reason),
        }
    }
}

/// `m:ss`, or `?` when unknown.
pub fn format_duration(secs: Option<f64>) -> String {
    match secs {
        Some(s) if s > 0.0 => {
            let total = s as u64;
            format!("{}:{:02}", total / 60, total % 60)
        }
        _ => "?".to_string(),
    }
}

#[derive(Tabled)]
struct DryRunRow<'a> {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "TITLE")]
    title: Cow<'a, str>,
    #[tabled(rename = "DURATION")]
    duration: String,
    #[tabled(rename = "ARCHIVED")]
    archived: &'static str,
    #[tabled(rename = "URL")]
    url: Cow<'a, str>,
}

/// Dry-run table followed by the total line.
pub fn render_dry_run(entries: &[DryRunEntry]) -> String {
    let rows = entries.iter().enumerate().map(|(i, entry)| match &entry.error {
        Some(reason) => DryRunRow {
            index: i + 1,
            title: Cow::Borrowed("ERROR"),
            duration: "-".to_string(),
            archived: "-",
            url: Cow::Owned(format!("{} ({})", entry.url, reason)),
        },
        None => DryRunRow {
            index: i + 1,
            title: Cow::Borrowed(entry.title.as_deref().unwrap_or("?")),
            duration: format_duration(entry.duration_secs),
            archived: if entry.archived { "yes" } else { "no" },
            url: Cow::Borrowed(&entry.url),
        },
    });

    let mut out = Table::new(rows)
        .with(Style::modern())
        .with(Modify::new(Columns::single(1)).with(Width::truncate(TITLE_WIDTH).suffix("...")))
        .to_string();
    out.push_str(&format!("\n\nTotal: {} video(s) found\n", entries.len()));
    out
}
