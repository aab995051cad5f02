//! VK Video batch downloader
//!
//! Classifies input URLs, expands channels and playlists, filters out items
//! already in the completion ledger and downloads the rest through yt-dlp with
//! a bounded worker pool.

pub mod classify;
pub mod concurrency;
pub mod controller;
pub mod executor;
pub mod extractor;
pub mod html_links;
pub mod ledger;
pub mod pool;
pub mod report;
pub mod startup;
pub mod task;

pub use vkvideo_dl_config as config;
pub use vkvideo_dl_config::Config;
pub use classify::{classify, extract_item_id, read_list_file, ClassifiedUrl, ClassifyError, UrlKind};
pub use concurrency::resolve_concurrency;
pub use controller::{
    collect_inputs, format_duration, render_dry_run, BatchController, BatchError, DryRunEntry,
    FormatListing, Plan, RunOutcome, RunStatus,
};
pub use executor::{DownloadExecutor, TaskExecutor};
pub use extractor::{ExtractError, MediaExtractor, MemberStream, ProbeEntry, YtDlp, YtDlpSettings};
pub use html_links::{extract_video_urls, read_html, write_url_list};
pub use ledger::{CompletionLedger, LedgerError};
pub use pool::{batch_progress_bar, progress_line, PoolError, PoolRun, WorkerPool};
pub use report::{render_summary, Report, ReportRecord, RunSummary};
pub use startup::{run_preflight, PreflightError, PreflightReport};
pub use task::{CookieSource, FailureKind, Outcome, OutcomeStatus, Task, TaskOptions};
