//! Run report aggregation
//!
//! Workers push [`Outcome`]s into a shared [`Report`]; at the end of a run the
//! report renders the console summary and appends one JSON line per outcome
//! (plus a closing summary line) to a dated file under the logs directory.

use crate::task::{FailureKind, Outcome, OutcomeStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tabled::settings::object::Columns;
use tabled::settings::{Modify, Style, Width};
use tabled::{Table, Tabled};
use tokio::sync::RwLock;
use uuid::Uuid;

/// One failed URL and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureEntry {
    pub url: String,
    pub reason: String,
}

/// Aggregate counts for a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub total: usize,
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub failures: Vec<FailureEntry>,
}

impl RunSummary {
    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }

    pub fn totals_line(&self) -> String {
        format!(
            "Total: {} succeeded, {} skipped, {} failed, {} total",
            self.succeeded, self.skipped, self.failed, self.total
        )
    }
}

/// Persisted form of one outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportRecord {
    pub run_id: String,
    pub url: String,
    pub item_id: Option<String>,
    pub status: OutcomeStatus,
    pub failure_kind: Option<FailureKind>,
    pub reason: Option<String>,
    pub output_path: Option<PathBuf>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct SummaryLine<'a> {
    run_id: &'a str,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    summary: &'a RunSummary,
}

#[derive(Debug, Default)]
struct ReportState {
    records: Vec<ReportRecord>,
    summary: RunSummary,
}

/// Thread-safe outcome sink shared by all workers of a run.
#[derive(Debug, Clone)]
pub struct Report {
    run_id: String,
    started_at: DateTime<Utc>,
    state: Arc<RwLock<ReportState>>,
}

impl Default for Report {
    fn default() -> Self {
        Self::new()
    }
}

impl Report {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            started_at: Utc::now(),
            state: Arc::new(RwLock::new(ReportState::default())),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Fold one outcome into the counters.
    pub async fn record(&self, outcome: &Outcome) {
        let record = ReportRecord {
            run_id: self.run_id.clone(),
            url: outcome.url().to_string(),
            item_id: outcome.item_id.clone(),
            status: outcome.status,
            failure_kind: outcome.failure_kind,
            reason: outcome.error_reason.clone(),
            output_path: outcome.output_path.clone(),
            timestamp: outcome.finished_at,
        };

        let mut state = self.state.write().await;
        state.summary.total += 1;
        match outcome.status {
            OutcomeStatus::Success => state.summary.succeeded += 1,
            OutcomeStatus::Skipped => state.summary.skipped += 1,
            OutcomeStatus::Failed => {
                state.summary.failed += 1;
                state.summary.failures.push(FailureEntry {
                    url: record.url.clone(),
                    reason: record
                        .reason
                        .clone()
                        .unwrap_or_else(|| "unknown error".to_string()),
                });
            }
        }
        state.records.push(record);
    }

    /// Snapshot of the counters. Failures are sorted by URL so the summary
    /// does not depend on completion order.
    pub async fn summary(&self) -> RunSummary {
        let mut summary = self.state.read().await.summary.clone();
        summary.failures.sort_by(|a, b| a.url.cmp(&b.url));
        summary
    }

    /// Records in the order they were received.
    pub async fn records(&self) -> Vec<ReportRecord> {
        self.state.read().await.records.clone()
    }

    /// Path of this run's log file inside `logs_dir`.
    pub fn log_path(&self, logs_dir: &Path) -> PathBuf {
        logs_dir.join(format!(
            "run-{}.jsonl",
            self.started_at.format("%Y-%m-%d_%H-%M-%S")
        ))
    }

    /// Append all records and a summary line to the dated log file.
    pub async fn write_log(&self, logs_dir: &Path) -> io::Result<PathBuf> {
        fs::create_dir_all(logs_dir)?;
        let path = self.log_path(logs_dir);

        let summary = self.summary().await;
        let state = self.state.read().await;

        let mut buf = String::new();
        for record in &state.records {
            buf.push_str(&serde_json::to_string(record).map_err(io::Error::other)?);
            buf.push('\n');
        }
        let line = SummaryLine {
            run_id: &self.run_id,
            started_at: self.started_at,
            finished_at: Utc::now(),
            summary: &summary,
        };
        buf.push_str(&serde_json::to_string(&line).map_err(io::Error::other)?);
        buf.push('\n');

        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(buf.as_bytes())?;
        file.flush()?;
        Ok(path)
    }
}

/// Longest URL shown in the summary table before it is cut.
const URL_WIDTH: usize = 60;

#[derive(Tabled)]
struct SummaryRow<'a> {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "URL")]
    url: &'a str,
    #[tabled(rename = "STATUS")]
    status: OutcomeStatus,
    #[tabled(rename = "REASON")]
    reason: &'a str,
}

/// Console table of every record followed by the totals line.
pub fn render_summary(records: &[ReportRecord], summary: &RunSummary) -> String {
    let rows = records.iter().enumerate().map(|(i, record)| SummaryRow {
        index: i + 1,
        url: &record.url,
        status: record.status,
        reason: record.reason.as_deref().unwrap_or(""),
    });
    let table = Table::new(rows)
        .with(Style::modern())
        .with(Modify::new(Columns::single(1)).with(Width::truncate(URL_WIDTH).suffix("...")))
        .to_string();

    let mut out = table;
    out.push('\n');
    out.push_str(&summary.totals_line());
    out.push('\n');

    if !summary.failures.is_empty() {
        out.push_str("\nFailed:\n");
        for failure in &summary.failures {
            out.push_str(&format!("  {}\n    {}\n", failure.url, failure.reason));
        }
    }
    out
}
