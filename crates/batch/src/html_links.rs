//! Video link extraction from saved HTML pages.
//!
//! A pure text scan: no network access. Links are recognized with the same
//! URL grammar the classifier uses for single videos.

use crate::classify::{embedded_video_re, video_item_id};
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::Path;

/// Unique video URLs in `html`, in first-seen order.
///
/// Two links to the same video on different VK hosts count as one. When
/// `owner` is given only videos of that owner id (e.g. `4725344` or
/// `-1719791`) are kept.
pub fn extract_video_urls(html: &str, owner: Option<&str>) -> Vec<String> {
    let owner = owner.map(str::trim).filter(|o| !o.is_empty());
    let mut seen = HashSet::new();
    let mut urls = Vec::new();

    for caps in embedded_video_re().captures_iter(html) {
        let (Some(whole), Some(owner_id), Some(video_id)) = (caps.get(0), caps.get(1), caps.get(2))
        else {
            continue;
        };
        if owner.is_some_and(|o| o != owner_id.as_str()) {
            continue;
        }
        if seen.insert(video_item_id(owner_id.as_str(), video_id.as_str())) {
            urls.push(whole.as_str().to_string());
        }
    }
    urls
}

/// Read an HTML file, tolerating invalid UTF-8.
pub fn read_html(path: &Path) -> io::Result<String> {
    let bytes = fs::read(path)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Write one URL per line, usable as a list file.
pub fn write_url_list(path: &Path, urls: &[String]) -> io::Result<()> {
    let mut text = urls.join("\n");
    text.push('\n');
    fs::write(path, text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::read_list_file;
    use tempfile::TempDir;

    const FIXTURE: &str = r#"<html><body>
<a href="https://vkvideo.ru/video111_1">one</a>
<div data-href="https://vkvideo.ru/video222_5"></div>
<a href="https://vkvideo.ru/video111_2?list=ln-abc">two</a>
<a href="https://vkvideo.ru/video111_1">one again</a>
<a href="https://vkvideo.ru/video222_6">other owner</a>
<script>var u = "https://vkvideo.ru/video111_3";</script>
<a href="https://vkvideo.ru/video222_5">other again</a>
</body></html>"#;

    #[test]
    fn test_owner_filter_keeps_only_owner_links() {
        let urls = extract_video_urls(FIXTURE, Some("111"));
        assert_eq!(
            urls,
            vec![
                "https://vkvideo.ru/video111_1",
                "https://vkvideo.ru/video111_2",
                "https://vkvideo.ru/video111_3",
            ]
        );
    }

    #[test]
    fn test_without_filter_all_unique_in_order() {
        let urls = extract_video_urls(FIXTURE, None);
        assert_eq!(
            urls,
            vec![
                "https://vkvideo.ru/video111_1",
                "https://vkvideo.ru/video222_5",
                "https://vkvideo.ru/video111_2",
                "https://vkvideo.ru/video222_6",
                "https://vkvideo.ru/video111_3",
            ]
        );
    }

    #[test]
    fn test_negative_owner_and_host_aliases() {
        let html = "https://vk.com/video-1719791_10 https://vkvideo.ru/video-1719791_10 \
                    https://vkvideo.ru/video-1719791_11 https://vkvideo.ru/video1719791_12";
        let urls = extract_video_urls(html, Some("-1719791"));
        assert_eq!(
            urls,
            vec!["https://vk.com/video-1719791_10", "https://vkvideo.ru/video-1719791_11"]
        );
    }

    #[test]
    fn test_write_then_read_as_list_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("urls.txt");
        let urls = extract_video_urls(FIXTURE, Some("111"));

        write_url_list(&path, &urls).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 3);
        assert_eq!(read_list_file(&path).unwrap(), urls);
    }

    #[test]
    fn test_read_html_lossy() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dump.html");
        let mut bytes = b"<a href=\"https://vkvideo.ru/video1_2\">".to_vec();
        bytes.extend_from_slice(&[0xff, 0xfe]);
        fs::write(&path, bytes).unwrap();

        let html = read_html(&path).unwrap();
        assert_eq!(extract_video_urls(&html, None), vec!["https://vkvideo.ru/video1_2"]);
        assert!(read_html(&dir.path().join("missing.html")).is_err());
    }
}
