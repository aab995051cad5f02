//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// Default config file looked up when `--config` is not given
pub const DEFAULT_CONFIG_FILE: &str = "vkvideo-dl.toml";

/// Error type for configuration operations
#[derive(Debug, Error)]
pub enum ConfigError {
    /// IO error reading config file
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// TOML parsing error
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    /// A value or combination of values that cannot be used
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Requested video quality, mapped to a yt-dlp format selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Quality {
    #[default]
    #[serde(rename = "best")]
    Best,
    #[serde(rename = "1080")]
    P1080,
    #[serde(rename = "720")]
    P720,
    #[serde(rename = "480")]
    P480,
    #[serde(rename = "360")]
    P360,
    #[serde(rename = "worst")]
    Worst,
}

impl Quality {
    pub const ALL: [Quality; 6] = [
        Quality::Best,
        Quality::P1080,
        Quality::P720,
        Quality::P480,
        Quality::P360,
        Quality::Worst,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Quality::Best => "best",
            Quality::P1080 => "1080",
            Quality::P720 => "720",
            Quality::P480 => "480",
            Quality::P360 => "360",
            Quality::Worst => "worst",
        }
    }

    /// Height cap in pixels, `None` for best/worst
    pub fn max_height(&self) -> Option<u32> {
        match self {
            Quality::P1080 => Some(1080),
            Quality::P720 => Some(720),
            Quality::P480 => Some(480),
            Quality::P360 => Some(360),
            Quality::Best | Quality::Worst => None,
        }
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Quality {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase();
        let normalized = normalized.trim_end_matches('p');
        Quality::ALL
            .into_iter()
            .find(|q| q.as_str() == normalized)
            .ok_or_else(|| {
                ConfigError::Invalid(format!(
                    "unknown quality '{}', expected one of best, 1080, 720, 480, 360, worst",
                    s
                ))
            })
    }
}

/// Browser to extract cookies from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Browser {
    #[default]
    Chrome,
    Firefox,
    Edge,
    Safari,
    Brave,
    Chromium,
    Opera,
    Vivaldi,
}

impl Browser {
    pub const ALL: [Browser; 8] = [
        Browser::Chrome,
        Browser::Firefox,
        Browser::Edge,
        Browser::Safari,
        Browser::Brave,
        Browser::Chromium,
        Browser::Opera,
        Browser::Vivaldi,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Browser::Chrome => "chrome",
            Browser::Firefox => "firefox",
            Browser::Edge => "edge",
            Browser::Safari => "safari",
            Browser::Brave => "brave",
            Browser::Chromium => "chromium",
            Browser::Opera => "opera",
            Browser::Vivaldi => "vivaldi",
        }
    }
}

impl fmt::Display for Browser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Browser {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase();
        Browser::ALL
            .into_iter()
            .find(|b| b.as_str() == normalized)
            .ok_or_else(|| ConfigError::Invalid(format!("unsupported cookie browser '{}'", s)))
    }
}

/// Download-related configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DownloadConfig {
    /// Root directory for downloaded files
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Quality selector applied to every task
    #[serde(default)]
    pub quality: Quality,
    /// Maximum parallel downloads (0 = auto-derive)
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: u32,
    /// Bandwidth cap handed to yt-dlp, e.g. "5M"
    #[serde(default)]
    pub rate_limit: Option<String>,
    /// yt-dlp output template, relative to `output_dir`
    #[serde(default = "default_output_template")]
    pub output_template: String,
    /// Container the merged streams end up in
    #[serde(default = "default_merge_output_format")]
    pub merge_output_format: String,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("./downloads")
}

fn default_max_concurrent() -> u32 {
    3
}

fn default_output_template() -> String {
    "%(uploader)s/%(title)s [%(id)s].%(ext)s".to_string()
}

fn default_merge_output_format() -> String {
    "mp4".to_string()
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            quality: Quality::default(),
            max_concurrent: default_max_concurrent(),
            rate_limit: None,
            output_template: default_output_template(),
            merge_output_format: default_merge_output_format(),
        }
    }
}

/// Cookie source configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuthConfig {
    /// Browser to read cookies from (None = public videos only)
    #[serde(default = "default_cookies_browser")]
    pub cookies_browser: Option<Browser>,
    /// Netscape-format cookie jar; takes precedence over the browser
    #[serde(default)]
    pub cookies_file: Option<PathBuf>,
}

fn default_cookies_browser() -> Option<Browser> {
    Some(Browser::Chrome)
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            cookies_browser: default_cookies_browser(),
            cookies_file: None,
        }
    }
}

/// Completion ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArchiveConfig {
    /// Skip items already recorded in the ledger
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Ledger file, one completed item per line
    #[serde(default = "default_archive_file")]
    pub file: PathBuf,
}

fn default_true() -> bool {
    true
}

fn default_archive_file() -> PathBuf {
    PathBuf::from("downloaded.txt")
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            file: default_archive_file(),
        }
    }
}

/// Postprocessing flags forwarded to yt-dlp
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PostprocessConfig {
    #[serde(default = "default_true")]
    pub embed_thumbnail: bool,
    #[serde(default = "default_true")]
    pub embed_metadata: bool,
    #[serde(default)]
    pub write_description: bool,
}

impl Default for PostprocessConfig {
    fn default() -> Self {
        Self {
            embed_thumbnail: true,
            embed_metadata: true,
            write_description: false,
        }
    }
}

/// Retry settings owned by yt-dlp itself
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_retries")]
    pub fragment_retries: u32,
    /// Seconds between HTTP retries
    #[serde(default = "default_retry_sleep_secs")]
    pub retry_sleep_secs: u32,
}

fn default_retries() -> u32 {
    5
}

fn default_retry_sleep_secs() -> u32 {
    5
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            retries: default_retries(),
            fragment_retries: default_retries(),
            retry_sleep_secs: default_retry_sleep_secs(),
        }
    }
}

/// Run report location
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    #[serde(default = "default_logs_dir")]
    pub logs_dir: PathBuf,
}

fn default_logs_dir() -> PathBuf {
    PathBuf::from("logs")
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            logs_dir: default_logs_dir(),
        }
    }
}

/// External tool locations
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolsConfig {
    #[serde(default = "default_ytdlp")]
    pub ytdlp: PathBuf,
    #[serde(default = "default_ffmpeg")]
    pub ffmpeg: PathBuf,
    /// Abort startup when no JavaScript runtime is found
    #[serde(default)]
    pub require_js_runtime: bool,
}

fn default_ytdlp() -> PathBuf {
    PathBuf::from("yt-dlp")
}

fn default_ffmpeg() -> PathBuf {
    PathBuf::from("ffmpeg")
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            ytdlp: default_ytdlp(),
            ffmpeg: default_ffmpeg(),
            require_js_runtime: false,
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub download: DownloadConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub archive: ArchiveConfig,
    #[serde(default)]
    pub postprocess: PostprocessConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Resolve the file layer of the configuration.
    ///
    /// An explicitly named file must exist. Without one, `vkvideo-dl.toml` in the
    /// working directory is used when present and built-in defaults otherwise.
    pub fn load_layered(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match explicit {
            Some(path) => Self::load_from_file(path)?,
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_FILE);
                if default_path.exists() {
                    Self::load_from_file(default_path)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - VKDL_OUTPUT_DIR -> download.output_dir
    /// - VKDL_QUALITY -> download.quality
    /// - VKDL_MAX_CONCURRENT -> download.max_concurrent
    /// - VKDL_RATE_LIMIT -> download.rate_limit
    /// - VKDL_COOKIES_BROWSER -> auth.cookies_browser
    /// - VKDL_COOKIES_FILE -> auth.cookies_file
    /// - VKDL_ARCHIVE_FILE -> archive.file
    /// - VKDL_LOGS_DIR -> logging.logs_dir
    /// - VKDL_YTDLP -> tools.ytdlp
    ///
    /// Values that fail to parse are ignored.
    pub fn apply_env_overrides(&mut self) {
        if let Some(val) = non_empty_var("VKDL_OUTPUT_DIR") {
            self.download.output_dir = PathBuf::from(val);
        }

        if let Some(val) = non_empty_var("VKDL_QUALITY") {
            if let Ok(quality) = val.parse::<Quality>() {
                self.download.quality = quality;
            }
        }

        if let Some(val) = non_empty_var("VKDL_MAX_CONCURRENT") {
            if let Ok(n) = val.parse::<u32>() {
                self.download.max_concurrent = n;
            }
        }

        if let Some(val) = non_empty_var("VKDL_RATE_LIMIT") {
            self.download.rate_limit = Some(val);
        }

        if let Some(val) = non_empty_var("VKDL_COOKIES_BROWSER") {
            match val.to_lowercase().as_str() {
                "none" | "off" => self.auth.cookies_browser = None,
                other => {
                    if let Ok(browser) = other.parse::<Browser>() {
                        self.auth.cookies_browser = Some(browser);
                    }
                }
            }
        }

        if let Some(val) = non_empty_var("VKDL_COOKIES_FILE") {
            self.auth.cookies_file = Some(PathBuf::from(val));
        }

        if let Some(val) = non_empty_var("VKDL_ARCHIVE_FILE") {
            self.archive.file = PathBuf::from(val);
        }

        if let Some(val) = non_empty_var("VKDL_LOGS_DIR") {
            self.logging.logs_dir = PathBuf::from(val);
        }

        if let Some(val) = non_empty_var("VKDL_YTDLP") {
            self.tools.ytdlp = PathBuf::from(val);
        }
    }

    /// Check values that serde cannot reject on its own
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.download.output_template.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "output template must not be empty".to_string(),
            ));
        }

        if let Some(limit) = &self.download.rate_limit {
            if !is_valid_rate_limit(limit) {
                return Err(ConfigError::Invalid(format!(
                    "rate limit '{}' must look like 500K, 5M or 1.5G",
                    limit
                )));
            }
        }

        if self.download.merge_output_format.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "merge output format must not be empty".to_string(),
            ));
        }

        Ok(())
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Accepts `<number>[K|M|G]`, case-insensitive
pub fn is_valid_rate_limit(value: &str) -> bool {
    let value = value.trim();
    let digits = value.trim_end_matches(|c: char| matches!(c, 'k' | 'K' | 'm' | 'M' | 'g' | 'G'));
    // at most one unit suffix
    if value.len() - digits.len() > 1 {
        return false;
    }
    !digits.is_empty()
        && digits.chars().all(|c| c.is_ascii_digit() || c == '.')
        && digits.parse::<f64>().map(|n| n > 0.0).unwrap_or(false)
}
