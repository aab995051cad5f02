//! Classifier module for tagging input URLs.
//!
//! This module recognizes the VK Video URL shapes (single video, channel,
//! playlist) and derives the stable item identifier used as the completion
//! ledger key. It also owns list-file parsing: comments and blank lines are
//! dropped, everything else is an input URL.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;

/// Marker that starts a comment line in a list file.
pub const COMMENT_MARKER: char = '#';

/// Hosts that serve VK Video pages.
const HOSTS: &str = r"(?:www\.|m\.)?(?:vkvideo\.ru|vk\.com|vk\.ru)";

/// Classification of an input URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UrlKind {
    /// A single downloadable video or clip.
    Video,
    /// A channel, user or community video listing.
    Channel,
    /// A playlist (album) of videos.
    Playlist,
    /// A URL the classifier does not recognize; handed to yt-dlp unverified.
    Unknown,
}

impl UrlKind {
    /// Channels and playlists must be enumerated before download.
    pub fn is_container(&self) -> bool {
        matches!(self, UrlKind::Channel | UrlKind::Playlist)
    }
}

impl std::fmt::Display for UrlKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UrlKind::Video => write!(f, "video"),
            UrlKind::Channel => write!(f, "channel"),
            UrlKind::Playlist => write!(f, "playlist"),
            UrlKind::Unknown => write!(f, "unknown"),
        }
    }
}

/// Errors raised for inputs that cannot be used at all.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ClassifyError {
    #[error("empty input")]
    Empty,

    #[error("not a URL: {0}")]
    Malformed(String),
}

/// A classified input URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedUrl {
    /// Normalized URL (scheme added when missing).
    pub url: String,
    pub kind: UrlKind,
    /// Ledger key for videos, container key for channels/playlists.
    pub item_id: Option<String>,
}

impl ClassifiedUrl {
    /// Key used to drop duplicate tasks within one run.
    pub fn dedupe_key(&self) -> &str {
        self.item_id.as_deref().unwrap_or(&self.url)
    }
}

fn video_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(&format!(
            r"^https?://{HOSTS}/(?:video|clip)(-?\d+)_(\d+)(?:[/?#]|$)"
        ))
        .expect("video pattern is valid")
    })
}

fn video_param_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(&format!(
            r"^https?://{HOSTS}/[^?#]*\?(?:[^#]*&)?z=(?:video|clip)(-?\d+)_(\d+)"
        ))
        .expect("z-parameter pattern is valid")
    })
}

fn playlist_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(&format!(
            r"^https?://{HOSTS}/(?:video/)?playlist/(-?\d+)_(\d+)(?:[/?#]|$)"
        ))
        .expect("playlist pattern is valid")
    })
}

fn album_section_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(&format!(
            r"^https?://{HOSTS}/videos(-?\d+)\?(?:[^#]*&)?section=(?:album|playlist)_(\d+)"
        ))
        .expect("album pattern is valid")
    })
}

fn channel_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(&format!(
            r"^https?://{HOSTS}/(?:video/)?@([A-Za-z0-9_.\-]+)(?:[/?#]|$)"
        ))
        .expect("channel pattern is valid")
    })
}

fn owner_listing_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(&format!(r"^https?://{HOSTS}/videos(-?\d+)(?:[/?#]|$)"))
            .expect("owner listing pattern is valid")
    })
}

/// Pattern for video links embedded in arbitrary text (HTML dumps).
///
/// Capture 1 is the owner id, capture 2 the video id.
pub fn embedded_video_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(&format!(r"(?i)https://{HOSTS}/video(-?\d+)_(\d+)"))
            .expect("embedded video pattern is valid")
    })
}

/// Builds the ledger key for a video from its owner and video ids.
pub fn video_item_id(owner: &str, video: &str) -> String {
    format!("{}_{}", owner, video)
}

/// Returns the trimmed URL of a list-file line, or `None` for blank and
/// comment lines.
pub fn parse_list_line(line: &str) -> Option<&str> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with(COMMENT_MARKER) {
        None
    } else {
        Some(trimmed)
    }
}

/// Reads a newline-delimited list file, keeping file order.
pub fn read_list_file(path: &Path) -> io::Result<Vec<String>> {
    let content = fs::read_to_string(path)?;
    Ok(content
        .lines()
        .filter_map(parse_list_line)
        .map(str::to_string)
        .collect())
}

/// Adds `https://` to bare VK hosts so pasted links like `vk.com/video1_2` work,
/// and lowercases scheme and host so `VK.com` and `vk.com` classify alike.
fn normalize(input: &str) -> String {
    let lower = input.to_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        return lowercase_authority(input);
    }
    let bare_host = ["vkvideo.ru/", "vk.com/", "vk.ru/", "www.vk.com/", "m.vk.com/", "m.vkvideo.ru/"]
        .iter()
        .any(|host| lower.starts_with(host));
    if bare_host {
        lowercase_authority(&format!("https://{}", input))
    } else {
        input.to_string()
    }
}

/// Lowercases everything before the path; the path keeps its case.
fn lowercase_authority(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    let end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    format!(
        "{}://{}{}",
        scheme.to_ascii_lowercase(),
        rest[..end].to_ascii_lowercase(),
        &rest[end..]
    )
}

/// Classifies a single input string.
///
/// Recognized shapes are tagged with their kind; any other http(s) URL is
/// returned as [`UrlKind::Unknown`] so yt-dlp can still try it generically.
/// Inputs that are not URLs at all are rejected.
pub fn classify(input: &str) -> Result<ClassifiedUrl, ClassifyError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(ClassifyError::Empty);
    }

    let url = normalize(trimmed);
    let lower = url.to_lowercase();
    let has_scheme = lower.starts_with("http://") || lower.starts_with("https://");
    if !has_scheme || url.chars().any(char::is_whitespace) || url.len() <= "https://".len() {
        return Err(ClassifyError::Malformed(trimmed.to_string()));
    }

    if let Some(caps) = video_re()
        .captures(&url)
        .or_else(|| video_param_re().captures(&url))
    {
        let item_id = video_item_id(&caps[1], &caps[2]);
        return Ok(ClassifiedUrl {
            url,
            kind: UrlKind::Video,
            item_id: Some(item_id),
        });
    }

    if let Some(caps) = playlist_re()
        .captures(&url)
        .or_else(|| album_section_re().captures(&url))
    {
        let item_id = format!("playlist{}_{}", &caps[1], &caps[2]);
        return Ok(ClassifiedUrl {
            url,
            kind: UrlKind::Playlist,
            item_id: Some(item_id),
        });
    }

    if let Some(caps) = channel_re().captures(&url) {
        let item_id = format!("@{}", caps[1].to_lowercase());
        return Ok(ClassifiedUrl {
            url,
            kind: UrlKind::Channel,
            item_id: Some(item_id),
        });
    }

    if let Some(caps) = owner_listing_re().captures(&url) {
        let item_id = format!("videos{}", &caps[1]);
        return Ok(ClassifiedUrl {
            url,
            kind: UrlKind::Channel,
            item_id: Some(item_id),
        });
    }

    Ok(ClassifiedUrl {
        url,
        kind: UrlKind::Unknown,
        item_id: None,
    })
}

/// Extracts the video ledger key from a URL, if it is a single-video URL.
pub fn extract_item_id(url: &str) -> Option<String> {
    match classify(url) {
        Ok(ClassifiedUrl {
            kind: UrlKind::Video,
            item_id,
            ..
        }) => item_id,
        _ => None,
    }
}
