//! Download task and outcome model.
//!
//! A [`Task`] is created by the planning step and is never mutated afterwards;
//! the executor turns it into an [`Outcome`] which is folded into the run report.

use crate::classify::{ClassifiedUrl, UrlKind};
use crate::config::{AuthConfig, Browser, Config, Quality};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Where yt-dlp should read cookies from.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CookieSource {
    /// No cookies; public videos only.
    #[default]
    None,
    /// Extract cookies from an installed browser profile.
    Browser(Browser),
    /// Netscape-format cookie jar.
    File(PathBuf),
}

impl CookieSource {
    /// Resolves the cookie source from the auth section.
    ///
    /// A cookie file wins when it exists. A configured file that is missing
    /// falls back to the browser.
    pub fn from_config(auth: &AuthConfig) -> Self {
        if let Some(file) = &auth.cookies_file {
            if file.exists() {
                return CookieSource::File(file.clone());
            }
            warn!(
                path = %file.display(),
                "cookie file not found, falling back to browser cookies"
            );
        }
        match auth.cookies_browser {
            Some(browser) => CookieSource::Browser(browser),
            None => CookieSource::None,
        }
    }
}

impl std::fmt::Display for CookieSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CookieSource::None => write!(f, "none"),
            CookieSource::Browser(browser) => write!(f, "browser:{}", browser),
            CookieSource::File(path) => write!(f, "file:{}", path.display()),
        }
    }
}

/// Per-run settings stamped onto every task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskOptions {
    pub quality: Quality,
    pub output_dir: PathBuf,
    pub cookie_source: CookieSource,
    pub rate_limit: Option<String>,
}

impl TaskOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            quality: config.download.quality,
            output_dir: config.download.output_dir.clone(),
            cookie_source: CookieSource::from_config(&config.auth),
            rate_limit: config.download.rate_limit.clone(),
        }
    }
}

/// A resolved download job.
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub source_url: String,
    pub kind: UrlKind,
    /// Ledger key, when the classifier could derive one.
    pub item_id: Option<String>,
    pub quality: Quality,
    pub output_dir: PathBuf,
    pub cookie_source: CookieSource,
    pub rate_limit: Option<String>,
}

impl Task {
    pub fn new(classified: ClassifiedUrl, options: &TaskOptions) -> Self {
        Self {
            source_url: classified.url,
            kind: classified.kind,
            item_id: classified.item_id,
            quality: options.quality,
            output_dir: options.output_dir.clone(),
            cookie_source: options.cookie_source.clone(),
            rate_limit: options.rate_limit.clone(),
        }
    }
}

/// Final status of one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Success,
    /// Already in the ledger, or an input that could not be used.
    Skipped,
    Failed,
}

impl std::fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutcomeStatus::Success => write!(f, "success"),
            OutcomeStatus::Skipped => write!(f, "skipped"),
            OutcomeStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Which stage a failure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Channel or playlist listing failed.
    Enumeration,
    /// Network, auth, geo or private-video failure reported by yt-dlp.
    Extraction,
    /// ffmpeg postprocessing failed.
    Mux,
    /// The run was interrupted while the task was in flight.
    Interrupted,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Enumeration => write!(f, "enumeration"),
            FailureKind::Extraction => write!(f, "extraction"),
            FailureKind::Mux => write!(f, "mux"),
            FailureKind::Interrupted => write!(f, "interrupted"),
        }
    }
}

/// Result of attempting one task.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub task: Task,
    pub status: OutcomeStatus,
    pub failure_kind: Option<FailureKind>,
    pub error_reason: Option<String>,
    pub output_path: Option<PathBuf>,
    /// Identifier to record in the ledger on success.
    pub item_id: Option<String>,
    pub finished_at: DateTime<Utc>,
}

impl Outcome {
    pub fn success(task: Task, item_id: Option<String>, output_path: Option<PathBuf>) -> Self {
        let item_id = item_id.or_else(|| task.item_id.clone());
        Self {
            task,
            status: OutcomeStatus::Success,
            failure_kind: None,
            error_reason: None,
            output_path,
            item_id,
            finished_at: Utc::now(),
        }
    }

    pub fn skipped(task: Task, reason: impl Into<String>) -> Self {
        let item_id = task.item_id.clone();
        Self {
            task,
            status: OutcomeStatus::Skipped,
            failure_kind: None,
            error_reason: Some(reason.into()),
            output_path: None,
            item_id,
            finished_at: Utc::now(),
        }
    }

    pub fn failed(task: Task, kind: FailureKind, reason: impl Into<String>) -> Self {
        let item_id = task.item_id.clone();
        Self {
            task,
            status: OutcomeStatus::Failed,
            failure_kind: Some(kind),
            error_reason: Some(reason.into()),
            output_path: None,
            item_id,
            finished_at: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == OutcomeStatus::Success
    }

    pub fn url(&self) -> &str {
        &self.task.source_url
    }

    pub fn output_path(&self) -> Option<&Path> {
        self.output_path.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::classify;
    use tempfile::TempDir;

    fn options() -> TaskOptions {
        TaskOptions {
            quality: Quality::P720,
            output_dir: PathBuf::from("/tmp/out"),
            cookie_source: CookieSource::Browser(Browser::Firefox),
            rate_limit: Some("5M".to_string()),
        }
    }

    #[test]
    fn test_task_carries_run_options() {
        let task = Task::new(classify("https://vk.com/video1_2").unwrap(), &options());

        assert_eq!(task.source_url, "https://vk.com/video1_2");
        assert_eq!(task.kind, UrlKind::Video);
        assert_eq!(task.item_id.as_deref(), Some("1_2"));
        assert_eq!(task.quality, Quality::P720);
        assert_eq!(task.output_dir, PathBuf::from("/tmp/out"));
        assert_eq!(task.cookie_source, CookieSource::Browser(Browser::Firefox));
        assert_eq!(task.rate_limit.as_deref(), Some("5M"));
    }

    #[test]
    fn test_outcome_success_prefers_reported_id() {
        let task = Task::new(classify("https://example.com/v").unwrap(), &options());
        let outcome = Outcome::success(task.clone(), Some("9_9".to_string()), None);
        assert_eq!(outcome.item_id.as_deref(), Some("9_9"));
        assert!(outcome.is_success());

        let task = Task::new(classify("https://vk.com/video1_2").unwrap(), &options());
        let outcome = Outcome::success(task, None, Some(PathBuf::from("/tmp/out/a.mp4")));
        assert_eq!(outcome.item_id.as_deref(), Some("1_2"));
        assert_eq!(outcome.output_path(), Some(Path::new("/tmp/out/a.mp4")));
    }

    #[test]
    fn test_outcome_failed_keeps_reason_and_kind() {
        let task = Task::new(classify("https://vk.com/video1_2").unwrap(), &options());
        let outcome = Outcome::failed(task, FailureKind::Mux, "ffmpeg exited with 1");

        assert_eq!(outcome.status, OutcomeStatus::Failed);
        assert_eq!(outcome.failure_kind, Some(FailureKind::Mux));
        assert_eq!(outcome.error_reason.as_deref(), Some("ffmpeg exited with 1"));
        assert_eq!(outcome.url(), "https://vk.com/video1_2");
    }

    #[test]
    fn test_cookie_source_prefers_existing_file() {
        let dir = TempDir::new().unwrap();
        let jar = dir.path().join("cookies.txt");
        std::fs::write(&jar, "# Netscape HTTP Cookie File\n").unwrap();

        let auth = AuthConfig {
            cookies_browser: Some(Browser::Edge),
            cookies_file: Some(jar.clone()),
        };
        assert_eq!(CookieSource::from_config(&auth), CookieSource::File(jar));
    }

    #[test]
    fn test_cookie_source_missing_file_falls_back_to_browser() {
        let auth = AuthConfig {
            cookies_browser: Some(Browser::Safari),
            cookies_file: Some(PathBuf::from("/definitely/not/here/cookies.txt")),
        };
        assert_eq!(
            CookieSource::from_config(&auth),
            CookieSource::Browser(Browser::Safari)
        );

        let auth = AuthConfig {
            cookies_browser: None,
            cookies_file: None,
        };
        assert_eq!(CookieSource::from_config(&auth), CookieSource::None);
    }

    #[test]
    fn test_status_display() {
        assert_eq!(OutcomeStatus::Success.to_string(), "success");
        assert_eq!(OutcomeStatus::Skipped.to_string(), "skipped");
        assert_eq!(OutcomeStatus::Failed.to_string(), "failed");
        assert_eq!(FailureKind::Enumeration.to_string(), "enumeration");
    }
}
