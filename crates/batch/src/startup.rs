//! Pre-flight checks run before any task is attempted
//!
//! Verifies that the external tools the downloads depend on can be executed:
//! - yt-dlp (`yt-dlp --version`)
//! - ffmpeg (`ffmpeg -version`), which yt-dlp runs for merging and embedding
//! - a JavaScript runtime (deno, node or bun), which yt-dlp needs to solve
//!   player challenges on embedded third-party streams

use crate::config::Config;
use std::path::Path;
use std::process::Command;
use thiserror::Error;
use tracing::{info, warn};

/// JavaScript runtimes yt-dlp can use, in order of preference.
const JS_RUNTIMES: &[&str] = &["deno", "node", "bun"];

#[derive(Debug, Error)]
pub enum PreflightError {
    #[error("yt-dlp not available: {0}")]
    YtDlpUnavailable(String),

    #[error("ffmpeg not available: {0}")]
    FfmpegUnavailable(String),

    #[error("No JavaScript runtime found (tried {}); install deno or node", JS_RUNTIMES.join(", "))]
    JsRuntimeUnavailable,
}

/// A JavaScript runtime found on PATH.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsRuntime {
    pub name: String,
    pub version: String,
}

/// Versions discovered by the pre-flight checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreflightReport {
    pub ytdlp_version: String,
    pub ffmpeg_version: String,
    pub js_runtime: Option<JsRuntime>,
}

fn run_version(program: &Path, flag: &str) -> Result<String, String> {
    let output = Command::new(program)
        .arg(flag)
        .output()
        .map_err(|e| format!("{} {} failed; is it installed and in PATH? Error: {}", program.display(), flag, e))?;

    if !output.status.success() {
        return Err(format!("{} {} exited with {}", program.display(), flag, output.status));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Parse `yt-dlp --version` output, e.g. `2025.01.15`.
pub fn parse_ytdlp_version(output: &str) -> Option<String> {
    let line = output.lines().map(str::trim).find(|l| !l.is_empty())?;
    if line.starts_with(|c: char| c.is_ascii_digit()) {
        Some(line.to_string())
    } else {
        None
    }
}

/// Parse the version token out of `ffmpeg -version` output
///
/// Handles both release (`ffmpeg version 7.1 ...`) and git builds
/// (`ffmpeg version n8.0-12-g...` or `N-118000-g...`).
pub fn parse_ffmpeg_version(version_output: &str) -> Option<String> {
    let version_line = version_output
        .lines()
        .find(|line| line.to_lowercase().contains("ffmpeg version"))?;

    let lower = version_line.to_lowercase();
    let idx = lower.find("ffmpeg version")? + "ffmpeg version".len();
    version_line[idx..]
        .split_whitespace()
        .next()
        .map(str::to_string)
}

/// Run `yt-dlp --version`.
pub fn check_ytdlp_available(program: &Path) -> Result<String, PreflightError> {
    let output = run_version(program, "--version").map_err(PreflightError::YtDlpUnavailable)?;
    parse_ytdlp_version(&output).ok_or_else(|| {
        PreflightError::YtDlpUnavailable(format!(
            "could not parse version from output: {}",
            output.lines().next().unwrap_or("(empty)")
        ))
    })
}

/// Run `ffmpeg -version`.
pub fn check_ffmpeg_available(program: &Path) -> Result<String, PreflightError> {
    let output = run_version(program, "-version").map_err(PreflightError::FfmpegUnavailable)?;
    parse_ffmpeg_version(&output).ok_or_else(|| {
        PreflightError::FfmpegUnavailable(format!(
            "could not parse version from output: {}",
            output.lines().next().unwrap_or("(empty)")
        ))
    })
}

/// First JavaScript runtime that answers `--version`.
pub fn detect_js_runtime() -> Option<JsRuntime> {
    JS_RUNTIMES.iter().find_map(|name| {
        let output = run_version(Path::new(name), "--version").ok()?;
        let version = output.lines().next()?.trim().to_string();
        Some(JsRuntime {
            name: name.to_string(),
            version,
        })
    })
}

/// Run all pre-flight checks in order
///
/// 1. yt-dlp availability
/// 2. ffmpeg availability
/// 3. JavaScript runtime; a missing runtime only warns unless
///    `tools.require_js_runtime` is set
pub fn run_preflight(cfg: &Config) -> Result<PreflightReport, PreflightError> {
    let ytdlp_version = check_ytdlp_available(&cfg.tools.ytdlp)?;
    info!(version = %ytdlp_version, "yt-dlp available");

    let ffmpeg_version = check_ffmpeg_available(&cfg.tools.ffmpeg)?;
    info!(version = %ffmpeg_version, "ffmpeg available");

    let js_runtime = detect_js_runtime();
    match &js_runtime {
        Some(rt) => info!(runtime = %rt.name, version = %rt.version, "JavaScript runtime available"),
        None if cfg.tools.require_js_runtime => return Err(PreflightError::JsRuntimeUnavailable),
        None => warn!("no JavaScript runtime found; some embedded videos may fail to download"),
    }

    Ok(PreflightReport {
        ytdlp_version,
        ffmpeg_version,
        js_runtime,
    })
}
