//! Open counting from the pixel access log.
//!
//! The web server writes one line per pixel request:
//!
//! ```text
//! 24/Apr/2025:11:37:37 +0200|GET /mailing/1/abcdefghijkl/<signature>.gif HTTP/2.0
//! ```
//!
//! [`ingest`] reads what was appended since the last run, across one
//! rotation (`<log>.1`), and folds verified hits into the `open_count` of
//! tracked mailings. Read progress lives in the offset file and is only
//! advanced once the counts are stored.

use std::collections::{HashMap, HashSet};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;

use crate::app::App;
use crate::db::{Database, Id};
use crate::{config, Result};

use super::pixel::{parse_pixel_path, PixelPath, NAMESPACE};
use super::Mailing;

pub const DATE_FORMAT: &str = "%d/%b/%Y:%H:%M:%S %z";

static LINE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<timestamp>[^|]+)\|(?P<verb>GET|POST|PUT|DELETE|HEAD|OPTIONS) (?P<path>/[^.]+\.gif) (?P<version>HTTP/\d\.\d)$",
    )
    .expect("pixel log pattern")
});

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PixelLogLine {
    pub timestamp: DateTime<Utc>,
    pub path: String,
}

pub fn parse_line(line: &str) -> Option<PixelLogLine> {
    let captures = LINE_PATTERN.captures(line.trim())?;
    let timestamp = DateTime::parse_from_str(&captures["timestamp"], DATE_FORMAT).ok()?;
    Some(PixelLogLine {
        timestamp: timestamp.with_timezone(&Utc),
        path: captures["path"].to_string(),
    })
}

pub fn format_line(timestamp: DateTime<Utc>, verb: &str, path: &str, version: &str) -> String {
    format!("{}|{} {} {}", timestamp.format(DATE_FORMAT), verb, path, version)
}

/// Appends a request to the log, for setups where no web server in front
/// of the application writes it.
pub async fn append_line(log: impl AsRef<Path>, line: &str) -> Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log)
        .await?;
    file.write_all(format!("{line}\n").as_bytes()).await?;
    Ok(())
}

/// Verified pixel hit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PixelEvent {
    pub pixel: PixelPath,
    pub timestamp: DateTime<Utc>,
}

/// Keeps lines carrying a valid signature.
pub fn verify_lines(config: &config::Mailing, lines: &[String]) -> Vec<PixelEvent> {
    let mut events = vec![];
    for line in lines {
        let Some(parsed) = parse_line(line) else {
            continue;
        };
        let Some(pixel) = parse_pixel_path(config, &parsed.path) else {
            continue;
        };
        if !pixel.is_valid(config) {
            tracing::warn!("invalid signature on pixel path: {}", parsed.path);
            continue;
        }
        events.push(PixelEvent {
            pixel,
            timestamp: parsed.timestamp,
        });
    }
    events
}

/// Read position in the current log. The fingerprint identifies the file
/// by its first line so rotation is noticed.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct LogOffset {
    pub fingerprint: String,
    pub offset: u64,
}

pub struct LogTail {
    log: PathBuf,
    rotated: PathBuf,
    offset_path: PathBuf,
}

impl LogTail {
    pub fn new(log: impl Into<PathBuf>, offset_path: impl Into<PathBuf>) -> Self {
        let log = log.into();
        let mut rotated = log.clone().into_os_string();
        rotated.push(".1");
        Self {
            log,
            rotated: rotated.into(),
            offset_path: offset_path.into(),
        }
    }

    fn load_offset(&self) -> Result<Option<LogOffset>> {
        match std::fs::read_to_string(&self.offset_path) {
            Ok(content) => Ok(serde_json::from_str(&content).ok()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Complete lines appended since the stored offset, and the offset to
    /// store once they are processed.
    pub fn read_new_lines(&self) -> Result<(Vec<String>, LogOffset)> {
        let stored = self.load_offset()?;
        let current = fingerprint(&self.log)?;
        let mut lines = vec![];

        let start = match (&stored, &current) {
            (Some(stored), Some(current)) if stored.fingerprint == *current => stored.offset,
            (Some(stored), _) => {
                // The log was rotated since the last run, finish the old one.
                if fingerprint(&self.rotated)?.as_deref() == Some(stored.fingerprint.as_str()) {
                    lines.extend(read_from(&self.rotated, stored.offset)?.0);
                }
                0
            }
            (None, _) => 0,
        };

        let (new_lines, end) = match &current {
            Some(_) => read_from(&self.log, start)?,
            None => (vec![], 0),
        };
        lines.extend(new_lines);
        Ok((
            lines,
            LogOffset {
                fingerprint: current.unwrap_or_default(),
                offset: end,
            },
        ))
    }

    pub fn commit(&self, offset: &LogOffset) -> Result<()> {
        std::fs::write(&self.offset_path, serde_json::to_string(offset)?)?;
        Ok(())
    }
}

fn fingerprint(path: &Path) -> Result<Option<String>> {
    let file = match std::fs::File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let mut first = vec![];
    BufReader::new(file).read_until(b'\n', &mut first)?;
    if first.pop() != Some(b'\n') {
        // Nothing complete to identify the file by yet.
        return Ok(None);
    }
    Ok(Some(format!("{:x}", Sha256::digest(&first))))
}

/// Reads complete lines from `offset` on. Returns the lines and the offset
/// after the last complete line.
fn read_from(path: &Path, offset: u64) -> Result<(Vec<String>, u64)> {
    let mut file = std::fs::File::open(path)?;
    let len = file.metadata()?.len();
    // Truncated in place, start over.
    let offset = if offset > len { 0 } else { offset };
    file.seek(SeekFrom::Start(offset))?;
    let mut buffer = vec![];
    file.read_to_end(&mut buffer)?;

    let complete = match buffer.iter().rposition(|b| *b == b'\n') {
        Some(pos) => pos + 1,
        None => 0,
    };
    let text = String::from_utf8_lossy(&buffer[..complete]);
    let lines = text
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| l.to_string())
        .collect();
    Ok((lines, offset + complete as u64))
}

/// Folds pixel hits into per-mailing open counts.
///
/// Each tracked mailing keeps a high-water mark of accounted hits. Within
/// one run a token counts once; hits at or before the mark are ignored so
/// re-reading a log never counts twice.
pub struct PixelProcessor<'a> {
    db: &'a Database,
    mailings: HashMap<Id, Option<Mailing>>,
    token_set: HashMap<Id, HashSet<String>>,
    open_count: HashMap<Id, u64>,
}

impl<'a> PixelProcessor<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self {
            db,
            mailings: HashMap::new(),
            token_set: HashMap::new(),
            open_count: HashMap::new(),
        }
    }

    /// Processes the events and stores the results. Returns the number of
    /// new opens.
    pub fn run(mut self, events: impl IntoIterator<Item = PixelEvent>) -> Result<u64> {
        for event in events {
            if event.pixel.namespace != NAMESPACE {
                continue;
            }
            self.process(event)?;
        }

        let mut total = 0;
        for (id, mailing) in self.mailings {
            let Some(mailing) = mailing else {
                continue;
            };
            let count = self.open_count.get(&id).copied().unwrap_or(0);
            let mark = mailing.open_log_timestamp;
            self.db.update::<Mailing, _>(id, |mut stored| {
                if count == 0 && stored.open_log_timestamp >= mark {
                    return None;
                }
                stored.open_count += count;
                stored.open_log_timestamp = stored.open_log_timestamp.max(mark);
                Some(stored)
            })?;
            if count > 0 {
                tracing::info!(mailing = id, count, "processed pixel opens");
            }
            total += count;
        }
        Ok(total)
    }

    fn process(&mut self, event: PixelEvent) -> Result<()> {
        let id = event.pixel.mailing_id;
        if !self.mailings.contains_key(&id) {
            let mailing = self.db.get_opt::<Mailing>(id)?.filter(|m| m.tracking);
            self.mailings.insert(id, mailing);
        }
        let Some(Some(mailing)) = self.mailings.get_mut(&id) else {
            return Ok(());
        };
        let tokens = self.token_set.entry(id).or_default();

        if tokens.contains(&event.pixel.token) {
            // Seen in this run, only move the mark.
            mailing.open_log_timestamp = mailing.open_log_timestamp.max(Some(event.timestamp));
            return Ok(());
        }
        if let Some(mark) = mailing.open_log_timestamp {
            if mark >= event.timestamp {
                return Ok(());
            }
        }
        tokens.insert(event.pixel.token);
        *self.open_count.entry(id).or_default() += 1;
        mailing.open_log_timestamp = Some(event.timestamp);
        Ok(())
    }
}

/// Reads new pixel log lines and updates open counts.
pub fn ingest(app: &App) -> Result<u64> {
    let tail = LogTail::new(&app.config.mailing.pixel_log, &app.config.mailing.pixel_offset);
    let (lines, offset) = tail.read_new_lines()?;
    let events = verify_lines(&app.config.mailing, &lines);
    tracing::debug!(lines = lines.len(), events = events.len(), "read pixel log");
    let opens = PixelProcessor::new(&app.db).run(events)?;
    tail.commit(&offset)?;
    Ok(opens)
}
