//! Download executor
//!
//! Turns one [`Task`] into one yt-dlp invocation and folds every possible
//! error into an [`Outcome`]. The worker pool only ever sees outcomes.

use crate::extractor::{run_download, ExtractError, YtDlpSettings};
use crate::extractor::ytdlp::is_mux_failure;
use crate::task::{FailureKind, Outcome, Task};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Executes a single task. Implementations never fail; errors become
/// `Outcome::failed`.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, task: &Task, cancel: &CancellationToken) -> Outcome;
}

/// Executor backed by the yt-dlp executable.
#[derive(Debug, Clone)]
pub struct DownloadExecutor {
    settings: YtDlpSettings,
}

impl DownloadExecutor {
    pub fn new(settings: YtDlpSettings) -> Self {
        Self { settings }
    }
}

/// Classify an extraction error into the failure stage it came from.
pub fn failure_kind(err: &ExtractError) -> FailureKind {
    match err {
        ExtractError::Interrupted => FailureKind::Interrupted,
        ExtractError::Failed { reason, .. } if is_mux_failure(reason) => FailureKind::Mux,
        _ => FailureKind::Extraction,
    }
}

#[async_trait]
impl TaskExecutor for DownloadExecutor {
    async fn execute(&self, task: &Task, cancel: &CancellationToken) -> Outcome {
        if let Err(e) = tokio::fs::create_dir_all(&task.output_dir).await {
            return Outcome::failed(
                task.clone(),
                FailureKind::Extraction,
                format!(
                    "cannot create output directory {}: {}",
                    task.output_dir.display(),
                    e
                ),
            );
        }

        debug!(url = %task.source_url, quality = %task.quality, "download started");

        match run_download(&self.settings, task, cancel).await {
            Ok(report) => {
                info!(
                    url = %task.source_url,
                    path = ?report.output_path,
                    "download finished"
                );
                Outcome::success(task.clone(), report.item_id, report.output_path)
            }
            Err(err) => {
                let kind = failure_kind(&err);
                warn!(url = %task.source_url, kind = %kind, error = %err, "download failed");
                Outcome::failed(task.clone(), kind, err.to_string())
            }
        }
    }
}
