//! Completion ledger for items that have already been downloaded.
//!
//! The ledger is a flat file with one entry per line:
//!
//! ```text
//! vk 4725344_14264835 2026-10-18T09:12:44Z
//! ```
//!
//! The `vk <id>` prefix matches the archive format yt-dlp itself writes, so an
//! existing `--download-archive` file can be reused as a ledger. The timestamp
//! column is optional on load.

use chrono::{DateTime, SecondsFormat, Utc};
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, info};

/// Extractor key written in front of every identifier.
const EXTRACTOR_KEY: &str = "vk";

/// Ledger I/O failures. These abort the run.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Ledger I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// One persisted line of the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub item_id: String,
    pub timestamp: Option<DateTime<Utc>>,
}

impl LedgerEntry {
    pub fn now(item_id: impl Into<String>) -> Self {
        Self {
            item_id: item_id.into(),
            timestamp: Some(Utc::now()),
        }
    }

    /// Parses one ledger line. Blank lines yield `None`.
    pub fn parse_line(line: &str) -> Option<Self> {
        let mut fields = line.split_whitespace();
        let first = fields.next()?;
        let item_id = if first == EXTRACTOR_KEY {
            fields.next()?
        } else {
            first
        };
        let timestamp = fields
            .next()
            .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
            .map(|ts| ts.with_timezone(&Utc));

        Some(Self {
            item_id: item_id.to_string(),
            timestamp,
        })
    }

    pub fn to_line(&self) -> String {
        match &self.timestamp {
            Some(ts) => format!(
                "{} {} {}",
                EXTRACTOR_KEY,
                self.item_id,
                ts.to_rfc3339_opts(SecondsFormat::Secs, true)
            ),
            None => format!("{} {}", EXTRACTOR_KEY, self.item_id),
        }
    }
}

struct LedgerState {
    ids: HashSet<String>,
    /// Opened on first append.
    writer: Option<File>,
}

/// Persistent set of completed item identifiers.
///
/// `record` serializes appends behind a mutex, so concurrent workers never
/// interleave lines or lose an update.
pub struct CompletionLedger {
    path: PathBuf,
    state: Mutex<LedgerState>,
}

impl CompletionLedger {
    /// Reads the ledger file. A missing file is an empty ledger.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let path = path.as_ref().to_path_buf();

        let ids = match fs::read_to_string(&path) {
            Ok(content) => content
                .lines()
                .filter_map(LedgerEntry::parse_line)
                .map(|entry| entry.item_id)
                .collect(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => HashSet::new(),
            Err(source) => return Err(LedgerError::Io { path, source }),
        };

        info!(path = %path.display(), entries = ids.len(), "loaded completion ledger");

        Ok(Self {
            path,
            state: Mutex::new(LedgerState { ids, writer: None }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn contains(&self, item_id: &str) -> bool {
        self.lock().ids.contains(item_id)
    }

    pub fn len(&self) -> usize {
        self.lock().ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends `item_id` and syncs it to disk before returning.
    ///
    /// Returns `Ok(false)` when the id was already present; nothing is written
    /// in that case.
    pub fn record(&self, item_id: &str) -> Result<bool, LedgerError> {
        let mut state = self.lock();
        if state.ids.contains(item_id) {
            return Ok(false);
        }

        let line = LedgerEntry::now(item_id).to_line();
        self.append_line(&mut state, &line)
            .map_err(|source| LedgerError::Io {
                path: self.path.clone(),
                source,
            })?;

        state.ids.insert(item_id.to_string());
        debug!(item_id, "recorded in ledger");
        Ok(true)
    }

    fn append_line(&self, state: &mut LedgerState, line: &str) -> io::Result<()> {
        if state.writer.is_none() {
            if let Some(parent) = self.path.parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent)?;
                }
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?;
            state.writer = Some(file);
        }

        match state.writer.as_mut() {
            Some(file) => {
                file.write_all(format!("{}\n", line).as_bytes())?;
                file.flush()?;
                file.sync_data()
            }
            None => Err(io::Error::new(io::ErrorKind::Other, "ledger writer unavailable")),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LedgerState> {
        // A panicking holder cannot leave a half-written set behind: the id is
        // inserted only after the line is synced.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
