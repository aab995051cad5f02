//! yt-dlp invocation for VK Video downloads
//!
//! Builds the yt-dlp command lines for downloading, enumerating, probing and
//! format listing, and interprets their output. ffmpeg is never called here
//! directly; yt-dlp runs it as its merge/embed postprocessor.

use super::{ExtractError, MediaExtractor, MemberStream, ProbeEntry};
use crate::config::{Config, Quality};
use crate::task::{CookieSource, Task};
use async_trait::async_trait;
use serde_json::Value;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Marker printed by yt-dlp once the final file has been moved into place.
const ID_MARKER: &str = "vkdl-id:";
const FILE_MARKER: &str = "vkdl-file:";

/// Everything from the configuration that shapes a yt-dlp command line.
#[derive(Debug, Clone, PartialEq)]
pub struct YtDlpSettings {
    pub program: PathBuf,
    pub ffmpeg: PathBuf,
    pub output_template: String,
    pub merge_output_format: String,
    pub retries: u32,
    pub fragment_retries: u32,
    pub retry_sleep_secs: u32,
    pub embed_thumbnail: bool,
    pub embed_metadata: bool,
    pub write_description: bool,
}

impl YtDlpSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            program: config.tools.ytdlp.clone(),
            ffmpeg: config.tools.ffmpeg.clone(),
            output_template: config.download.output_template.clone(),
            merge_output_format: config.download.merge_output_format.clone(),
            retries: config.retry.retries,
            fragment_retries: config.retry.fragment_retries,
            retry_sleep_secs: config.retry.retry_sleep_secs,
            embed_thumbnail: config.postprocess.embed_thumbnail,
            embed_metadata: config.postprocess.embed_metadata,
            write_description: config.postprocess.write_description,
        }
    }
}

impl Default for YtDlpSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// What a successful download reported back.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DownloadReport {
    pub item_id: Option<String>,
    pub output_path: Option<PathBuf>,
}

/// Map a quality level to a yt-dlp format selector.
pub fn format_selector(quality: Quality) -> String {
    match quality {
        Quality::Best => "bestvideo+bestaudio/best".to_string(),
        Quality::Worst => "worstvideo+worstaudio/worst".to_string(),
        other => match other.max_height() {
            Some(h) => format!(
                "bestvideo[height<={h}]+bestaudio/best[height<={h}]/best",
                h = h
            ),
            None => "bestvideo+bestaudio/best".to_string(),
        },
    }
}

fn base_command(settings: &YtDlpSettings) -> Command {
    let mut cmd = Command::new(&settings.program);
    // user-level yt-dlp config must not alter the option bundle
    cmd.arg("--ignore-config");
    cmd
}

fn push_cookie_args(cmd: &mut Command, cookies: &CookieSource) {
    match cookies {
        CookieSource::None => {}
        CookieSource::Browser(browser) => {
            cmd.arg("--cookies-from-browser").arg(browser.as_str());
        }
        CookieSource::File(path) => {
            cmd.arg("--cookies").arg(path);
        }
    }
}

/// Build the yt-dlp command that downloads a single task.
///
/// The command prints the resolved item id and the final file path on
/// stdout, prefixed with markers that [`parse_download_output`] understands.
pub fn build_download_command(settings: &YtDlpSettings, task: &Task) -> Command {
    let mut cmd = base_command(settings);

    cmd.arg("--no-progress").arg("--newline");
    cmd.arg("--no-playlist");

    cmd.arg("-f").arg(format_selector(task.quality));
    cmd.arg("--merge-output-format")
        .arg(&settings.merge_output_format);
    cmd.arg("-o")
        .arg(task.output_dir.join(&settings.output_template));

    cmd.arg("--retries").arg(settings.retries.to_string());
    cmd.arg("--fragment-retries")
        .arg(settings.fragment_retries.to_string());
    cmd.arg("--retry-sleep")
        .arg(format!("http:{}", settings.retry_sleep_secs));

    push_cookie_args(&mut cmd, &task.cookie_source);

    if let Some(rate) = &task.rate_limit {
        cmd.arg("--limit-rate").arg(rate);
    }

    if settings.embed_thumbnail {
        cmd.arg("--embed-thumbnail");
    }
    if settings.embed_metadata {
        cmd.arg("--embed-metadata");
    }
    if settings.write_description {
        cmd.arg("--write-description");
    }

    if settings.ffmpeg != Path::new("ffmpeg") {
        cmd.arg("--ffmpeg-location").arg(&settings.ffmpeg);
    }

    // --print implies --simulate
    cmd.arg("--no-simulate");
    cmd.arg("--print")
        .arg(format!("after_move:{}%(id)s", ID_MARKER));
    cmd.arg("--print")
        .arg(format!("after_move:{}%(filepath)s", FILE_MARKER));

    cmd.arg("--").arg(&task.source_url);
    cmd
}

/// Build the command that lists the member URLs of a channel or playlist.
pub fn build_enumerate_command(
    settings: &YtDlpSettings,
    container_url: &str,
    cookies: &CookieSource,
) -> Command {
    let mut cmd = base_command(settings);
    cmd.arg("--flat-playlist");
    cmd.arg("--print").arg("url");
    push_cookie_args(&mut cmd, cookies);
    cmd.arg("--").arg(container_url);
    cmd
}

/// Build the metadata-only probe command.
pub fn build_probe_command(settings: &YtDlpSettings, url: &str, cookies: &CookieSource) -> Command {
    let mut cmd = base_command(settings);
    cmd.arg("--dump-single-json");
    cmd.arg("--flat-playlist");
    push_cookie_args(&mut cmd, cookies);
    cmd.arg("--").arg(url);
    cmd
}

/// Build the format table command.
pub fn build_list_formats_command(
    settings: &YtDlpSettings,
    url: &str,
    cookies: &CookieSource,
) -> Command {
    let mut cmd = base_command(settings);
    cmd.arg("-F");
    push_cookie_args(&mut cmd, cookies);
    cmd.arg("--").arg(url);
    cmd
}

/// Extract the item id and final path from download stdout.
pub fn parse_download_output(stdout: &str) -> DownloadReport {
    let mut report = DownloadReport::default();
    for line in stdout.lines() {
        let line = line.trim();
        if let Some(id) = line.strip_prefix(ID_MARKER) {
            if !id.is_empty() && id != "NA" {
                report.item_id = Some(id.to_string());
            }
        } else if let Some(path) = line.strip_prefix(FILE_MARKER) {
            if !path.is_empty() && path != "NA" {
                report.output_path = Some(PathBuf::from(path));
            }
        }
    }
    report
}

/// Pick a one-line human readable reason out of yt-dlp stderr.
///
/// Prefers the last `ERROR:` line, then the last non-empty line.
pub fn summarize_stderr(stderr: &str) -> String {
    let lines: Vec<&str> = stderr
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();

    lines
        .iter()
        .rev()
        .find(|l| l.starts_with("ERROR:"))
        .or_else(|| lines.last())
        .map(|l| l.to_string())
        .unwrap_or_else(|| "yt-dlp failed without output".to_string())
}

/// Whether a failure reason points at the ffmpeg postprocessing stage.
pub fn is_mux_failure(reason: &str) -> bool {
    let lower = reason.to_ascii_lowercase();
    lower.contains("postprocessing")
        || lower.contains("ffmpeg")
        || lower.contains("merging")
        || lower.contains("conversion failed")
}

fn spawn_error(program: &Path, source: io::Error) -> ExtractError {
    match source.kind() {
        io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => ExtractError::ToolNotFound {
            tool: program.display().to_string(),
            source,
        },
        _ => ExtractError::Io(source),
    }
}

fn status_error(status: std::process::ExitStatus, stderr: &str) -> ExtractError {
    match status.code() {
        Some(code) => ExtractError::Failed {
            code,
            reason: summarize_stderr(stderr),
        },
        None => ExtractError::Terminated,
    }
}

async fn run_to_completion(
    settings: &YtDlpSettings,
    cmd: Command,
) -> Result<String, ExtractError> {
    let mut cmd = tokio::process::Command::from(cmd);
    cmd.stdin(Stdio::null()).kill_on_drop(true);

    let output = cmd
        .output()
        .await
        .map_err(|e| spawn_error(&settings.program, e))?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    if output.status.success() {
        Ok(stdout)
    } else {
        Err(status_error(
            output.status,
            &String::from_utf8_lossy(&output.stderr),
        ))
    }
}

/// Execute a download and wait for it, killing yt-dlp if `cancel` fires.
pub async fn run_download(
    settings: &YtDlpSettings,
    task: &Task,
    cancel: &CancellationToken,
) -> Result<DownloadReport, ExtractError> {
    let cmd = build_download_command(settings, task);
    debug!(command = ?cmd, "starting yt-dlp");

    let mut cmd = tokio::process::Command::from(cmd);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = cmd
        .spawn()
        .map_err(|e| spawn_error(&settings.program, e))?;

    // dropping the wait future drops the child, which kills it
    let output = tokio::select! {
        output = child.wait_with_output() => output?,
        _ = cancel.cancelled() => return Err(ExtractError::Interrupted),
    };

    if output.status.success() {
        Ok(parse_download_output(&String::from_utf8_lossy(
            &output.stdout,
        )))
    } else {
        Err(status_error(
            output.status,
            &String::from_utf8_lossy(&output.stderr),
        ))
    }
}

fn probe_entry(value: &Value, fallback_url: &str) -> ProbeEntry {
    let text = |key: &str| value.get(key).and_then(Value::as_str).map(str::to_string);
    ProbeEntry {
        id: text("id"),
        title: text("title"),
        duration_secs: value.get("duration").and_then(Value::as_f64),
        url: text("webpage_url")
            .or_else(|| text("url"))
            .unwrap_or_else(|| fallback_url.to_string()),
    }
}

/// Turn `--dump-single-json` output into probe rows.
///
/// A playlist yields one row per entry; a single video yields one row.
pub fn parse_probe_json(json: &str, url: &str) -> Result<Vec<ProbeEntry>, ExtractError> {
    let value: Value = serde_json::from_str(json.trim())
        .map_err(|e| ExtractError::Parse(format!("probe output is not JSON: {}", e)))?;

    match value.get("entries").and_then(Value::as_array) {
        Some(entries) => Ok(entries
            .iter()
            .filter(|e| !e.is_null())
            .map(|e| probe_entry(e, url))
            .collect()),
        None => Ok(vec![probe_entry(&value, url)]),
    }
}

/// The yt-dlp executable behind [`MediaExtractor`].
#[derive(Debug, Clone)]
pub struct YtDlp {
    settings: YtDlpSettings,
}

impl YtDlp {
    pub fn new(settings: YtDlpSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &YtDlpSettings {
        &self.settings
    }
}

#[async_trait]
impl MediaExtractor for YtDlp {
    async fn enumerate(
        &self,
        container_url: &str,
        cookies: &CookieSource,
    ) -> Result<MemberStream, ExtractError> {
        let cmd = build_enumerate_command(&self.settings, container_url, cookies);
        debug!(command = ?cmd, "enumerating container");

        let mut cmd = tokio::process::Command::from(cmd);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let child = cmd
            .spawn()
            .map_err(|e| spawn_error(&self.settings.program, e))?;
        MemberStream::from_process(child)
    }

    async fn probe(
        &self,
        url: &str,
        cookies: &CookieSource,
    ) -> Result<Vec<ProbeEntry>, ExtractError> {
        let cmd = build_probe_command(&self.settings, url, cookies);
        debug!(command = ?cmd, "probing");
        let stdout = run_to_completion(&self.settings, cmd).await?;
        parse_probe_json(&stdout, url)
    }

    async fn list_formats(&self, url: &str, cookies: &CookieSource) -> Result<String, ExtractError> {
        let cmd = build_list_formats_command(&self.settings, url, cookies);
        debug!(command = ?cmd, "listing formats");
        run_to_completion(&self.settings, cmd).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::classify;
    use crate::config::Browser;
    use crate::task::TaskOptions;
    use proptest::prelude::*;

    fn get_command_args(cmd: &Command) -> Vec<String> {
        cmd.get_args()
            .filter_map(|arg| arg.to_str().map(String::from))
            .collect()
    }

    fn has_flag_with_value(args: &[String], flag: &str, value: &str) -> bool {
        args.windows(2).any(|pair| pair[0] == flag && pair[1] == value)
    }

    fn has_flag(args: &[String], flag: &str) -> bool {
        args.iter().any(|arg| arg == flag)
    }

    fn task_with(quality: Quality, cookies: CookieSource, rate_limit: Option<&str>) -> Task {
        let options = TaskOptions {
            quality,
            output_dir: PathBuf::from("/data/vk"),
            cookie_source: cookies,
            rate_limit: rate_limit.map(String::from),
        };
        Task::new(
            classify("https://vkvideo.ru/video-204353299_456239017").unwrap(),
            &options,
        )
    }

    #[test]
    fn test_format_selector_table() {
        assert_eq!(format_selector(Quality::Best), "bestvideo+bestaudio/best");
        assert_eq!(
            format_selector(Quality::P1080),
            "bestvideo[height<=1080]+bestaudio/best[height<=1080]/best"
        );
        assert_eq!(
            format_selector(Quality::P360),
            "bestvideo[height<=360]+bestaudio/best[height<=360]/best"
        );
        assert_eq!(format_selector(Quality::Worst), "worstvideo+worstaudio/worst");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_capped_selectors_mention_height(idx in 0usize..Quality::ALL.len()) {
            let quality = Quality::ALL[idx];
            let selector = format_selector(quality);
            match quality.max_height() {
                Some(h) => {
                    let cap = format!("[height<={}]", h);
                    prop_assert!(selector.contains(&cap));
                }
                None => prop_assert!(!selector.contains("height")),
            }
            // every selector has a plain fallback
            prop_assert!(selector.ends_with("/best") || selector.ends_with("/worst"));
        }
    }

    #[test]
    fn test_download_command_completeness() {
        let settings = YtDlpSettings::default();
        let task = task_with(
            Quality::P720,
            CookieSource::Browser(Browser::Firefox),
            Some("5M"),
        );
        let cmd = build_download_command(&settings, &task);
        let args = get_command_args(&cmd);

        assert_eq!(cmd.get_program(), "yt-dlp");
        assert_eq!(args[0], "--ignore-config");
        assert!(has_flag(&args, "--no-playlist"));
        assert!(has_flag_with_value(
            &args,
            "-f",
            "bestvideo[height<=720]+bestaudio/best[height<=720]/best"
        ));
        assert!(has_flag_with_value(&args, "--merge-output-format", "mp4"));
        assert!(has_flag_with_value(
            &args,
            "-o",
            "/data/vk/%(uploader)s/%(title)s [%(id)s].%(ext)s"
        ));
        assert!(has_flag_with_value(&args, "--retries", "5"));
        assert!(has_flag_with_value(&args, "--fragment-retries", "5"));
        assert!(has_flag_with_value(&args, "--retry-sleep", "http:5"));
        assert!(has_flag_with_value(&args, "--cookies-from-browser", "firefox"));
        assert!(has_flag_with_value(&args, "--limit-rate", "5M"));
        assert!(has_flag(&args, "--embed-thumbnail"));
        assert!(has_flag(&args, "--embed-metadata"));
        assert!(!has_flag(&args, "--write-description"));
        assert!(!has_flag(&args, "--ffmpeg-location"));
        assert!(has_flag(&args, "--no-simulate"));
        assert!(has_flag_with_value(&args, "--print", "after_move:vkdl-id:%(id)s"));

        // URL always comes last, after the option terminator
        let n = args.len();
        assert_eq!(args[n - 2], "--");
        assert_eq!(args[n - 1], "https://vkvideo.ru/video-204353299_456239017");
    }

    #[test]
    fn test_download_command_cookie_file_and_no_rate_limit() {
        let mut settings = YtDlpSettings::default();
        settings.ffmpeg = PathBuf::from("/opt/ffmpeg/bin/ffmpeg");
        settings.embed_thumbnail = false;
        settings.write_description = true;

        let task = task_with(
            Quality::Best,
            CookieSource::File(PathBuf::from("/home/u/cookies.txt")),
            None,
        );
        let args = get_command_args(&build_download_command(&settings, &task));

        assert!(has_flag_with_value(&args, "--cookies", "/home/u/cookies.txt"));
        assert!(!has_flag(&args, "--cookies-from-browser"));
        assert!(!has_flag(&args, "--limit-rate"));
        assert!(!has_flag(&args, "--embed-thumbnail"));
        assert!(has_flag(&args, "--write-description"));
        assert!(has_flag_with_value(
            &args,
            "--ffmpeg-location",
            "/opt/ffmpeg/bin/ffmpeg"
        ));
    }

    #[test]
    fn test_download_command_without_cookies() {
        let task = task_with(Quality::Best, CookieSource::None, None);
        let args = get_command_args(&build_download_command(&YtDlpSettings::default(), &task));
        assert!(!has_flag(&args, "--cookies"));
        assert!(!has_flag(&args, "--cookies-from-browser"));
    }

    #[test]
    fn test_auxiliary_commands() {
        let settings = YtDlpSettings::default();
        let cookies = CookieSource::Browser(Browser::Chrome);

        let args = get_command_args(&build_enumerate_command(
            &settings,
            "https://vkvideo.ru/@club",
            &cookies,
        ));
        assert!(has_flag(&args, "--flat-playlist"));
        assert!(has_flag_with_value(&args, "--print", "url"));
        assert!(has_flag_with_value(&args, "--cookies-from-browser", "chrome"));
        assert_eq!(args.last().map(String::as_str), Some("https://vkvideo.ru/@club"));

        let args = get_command_args(&build_probe_command(&settings, "https://vk.com/video1_2", &cookies));
        assert!(has_flag(&args, "--dump-single-json"));
        assert!(!has_flag(&args, "--no-simulate"));

        let args = get_command_args(&build_list_formats_command(
            &settings,
            "https://vk.com/video1_2",
            &CookieSource::None,
        ));
        assert!(has_flag(&args, "-F"));
        assert!(has_flag(&args, "--ignore-config"));
    }

    #[test]
    fn test_parse_download_output() {
        let stdout = "[vk] Extracting URL\nvkdl-id:-204353299_456239017\nvkdl-file:/data/vk/Club/Title [-204353299_456239017].mp4\n";
        let report = parse_download_output(stdout);
        assert_eq!(report.item_id.as_deref(), Some("-204353299_456239017"));
        assert_eq!(
            report.output_path,
            Some(PathBuf::from("/data/vk/Club/Title [-204353299_456239017].mp4"))
        );

        assert_eq!(parse_download_output("vkdl-id:NA\n"), DownloadReport::default());
    }

    #[test]
    fn test_summarize_stderr() {
        let stderr = "WARNING: something\nERROR: [vk] 1_2: Access denied\nsome trailing noise\n";
        assert_eq!(summarize_stderr(stderr), "ERROR: [vk] 1_2: Access denied");
        assert_eq!(summarize_stderr("just noise\n"), "just noise");
        assert_eq!(summarize_stderr(""), "yt-dlp failed without output");
    }

    #[test]
    fn test_is_mux_failure() {
        assert!(is_mux_failure("ERROR: Postprocessing: Conversion failed!"));
        assert!(is_mux_failure("ERROR: ffmpeg not found. Please install"));
        assert!(!is_mux_failure("ERROR: [vk] 1_2: This video is private"));
    }

    #[test]
    fn test_parse_probe_json_playlist_and_single() {
        let playlist = r#"{"_type":"playlist","entries":[
            {"id":"1_2","title":"First","duration":125.0,"url":"https://vk.com/video1_2"},
            null,
            {"id":"1_3","title":"Second","url":"https://vk.com/video1_3"}
        ]}"#;
        let entries = parse_probe_json(playlist, "https://vk.com/videos1").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].title.as_deref(), Some("First"));
        assert_eq!(entries[0].duration_secs, Some(125.0));
        assert_eq!(entries[1].duration_secs, None);

        let single = r#"{"id":"1_2","title":"Only","duration":61,"webpage_url":"https://vkvideo.ru/video1_2"}"#;
        let entries = parse_probe_json(single, "https://vk.com/video1_2").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].url, "https://vkvideo.ru/video1_2");
        assert_eq!(entries[0].duration_secs, Some(61.0));

        assert!(matches!(
            parse_probe_json("not json", "u"),
            Err(ExtractError::Parse(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_program_is_tool_not_found() {
        let mut settings = YtDlpSettings::default();
        settings.program = PathBuf::from("/nonexistent/bin/yt-dlp-missing");
        let task = task_with(Quality::Best, CookieSource::None, None);

        let err = run_download(&settings, &task, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractError::ToolNotFound { .. }));
    }
}
