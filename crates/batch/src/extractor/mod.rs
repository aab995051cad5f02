//! Interface to the external extraction tool.
//!
//! The rest of the crate only sees [`MediaExtractor`], [`MemberStream`] and
//! [`ExtractError`]; the yt-dlp specifics live in [`ytdlp`].

pub mod ytdlp;

pub use ytdlp::{
    build_download_command, build_enumerate_command, build_list_formats_command,
    build_probe_command, format_selector, run_download, DownloadReport, YtDlp, YtDlpSettings,
};

use crate::task::CookieSource;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::VecDeque;
use std::io;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout};
use tokio::task::JoinHandle;

/// Errors surfaced by the external extraction tool.
#[derive(Debug, Error)]
pub enum ExtractError {
    /// The executable could not be started at all
    #[error("{tool} not found or not executable: {source}")]
    ToolNotFound {
        tool: String,
        #[source]
        source: io::Error,
    },

    /// yt-dlp exited with non-zero status
    #[error("{reason} (exit code {code})")]
    Failed { code: i32, reason: String },

    /// yt-dlp was terminated by a signal
    #[error("yt-dlp was terminated by signal")]
    Terminated,

    /// The run was cancelled while yt-dlp was running
    #[error("interrupted before completion")]
    Interrupted,

    /// yt-dlp produced output that could not be understood
    #[error("unexpected yt-dlp output: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// One row of a metadata probe.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeEntry {
    pub id: Option<String>,
    pub title: Option<String>,
    pub duration_secs: Option<f64>,
    pub url: String,
}

/// Operations the batch controller needs from the extraction tool besides
/// downloading.
#[async_trait]
pub trait MediaExtractor: Send + Sync {
    /// Lists the members of a channel or playlist.
    async fn enumerate(
        &self,
        container_url: &str,
        cookies: &CookieSource,
    ) -> Result<MemberStream, ExtractError>;

    /// Fetches metadata without downloading.
    async fn probe(&self, url: &str, cookies: &CookieSource)
        -> Result<Vec<ProbeEntry>, ExtractError>;

    /// Returns the human-readable format table for a URL.
    async fn list_formats(&self, url: &str, cookies: &CookieSource)
        -> Result<String, ExtractError>;
}

enum MemberSource {
    Fixed(VecDeque<String>),
    Process {
        child: Child,
        lines: Lines<BufReader<ChildStdout>>,
        stderr: JoinHandle<String>,
    },
}

/// Finite, single-pass sequence of container member URLs.
///
/// `next_member` yields `Ok(None)` exactly at the end of the listing and keeps
/// returning `Ok(None)` afterwards. A listing process that exits with an error
/// surfaces as `Err` in place of the end marker.
pub struct MemberStream {
    source: MemberSource,
    finished: bool,
}

impl MemberStream {
    /// A stream over an already known list of members.
    pub fn from_members<I, S>(members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            source: MemberSource::Fixed(members.into_iter().map(Into::into).collect()),
            finished: false,
        }
    }

    /// A stream reading one member URL per stdout line of a listing process.
    pub(crate) fn from_process(mut child: Child) -> Result<Self, ExtractError> {
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ExtractError::Parse("listing process has no stdout".to_string()))?;
        let stderr = child.stderr.take();
        let stderr = tokio::spawn(async move {
            let mut buf = String::new();
            if let Some(mut stderr) = stderr {
                use tokio::io::AsyncReadExt;
                let _ = stderr.read_to_string(&mut buf).await;
            }
            buf
        });

        Ok(Self {
            source: MemberSource::Process {
                child,
                lines: BufReader::new(stdout).lines(),
                stderr,
            },
            finished: false,
        })
    }

    /// Returns the next member URL, or `None` at the end of the listing.
    pub async fn next_member(&mut self) -> Result<Option<String>, ExtractError> {
        if self.finished {
            return Ok(None);
        }

        let result = match &mut self.source {
            MemberSource::Fixed(queue) => Ok(queue.pop_front()),
            MemberSource::Process {
                child,
                lines,
                stderr,
            } => loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        // yt-dlp prints NA for entries without a URL
                        if line.is_empty() || line == "NA" {
                            continue;
                        }
                        break Ok(Some(line.to_string()));
                    }
                    Ok(None) => {
                        let status = child.wait().await?;
                        let stderr_text = stderr.await.unwrap_or_default();
                        break if status.success() {
                            Ok(None)
                        } else {
                            match status.code() {
                                Some(code) => Err(ExtractError::Failed {
                                    code,
                                    reason: ytdlp::summarize_stderr(&stderr_text),
                                }),
                                None => Err(ExtractError::Terminated),
                            }
                        };
                    }
                    Err(e) => break Err(ExtractError::Io(e)),
                }
            },
        };

        if !matches!(result, Ok(Some(_))) {
            self.finished = true;
        }
        result
    }
}
