//! Buffered, newline-delimited JSON log writer.
//!
//! Each logical stream (ledger records, cycle summaries, cycle traces) owns
//! one [`JsonlWriter`]. Lines are buffered in memory and written on flush;
//! an fsync flush guarantees the lines survive a crash right after it
//! returns. The current file is rotated to `<stem>-<unix_millis>.<ext>` once
//! it grows past the configured size, checked before every flush.

#![allow(clippy::missing_errors_doc)]

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use analysis_ledger_core::{format_rfc3339, now_utc};
use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

pub const DEFAULT_MAX_BYTES: u64 = 50 * 1024 * 1024;
pub const DEFAULT_EAGER_FLUSH_LINES: usize = 10;
pub const DEFAULT_BULK_FLUSH_LINES: usize = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriterOptions {
    /// Size above which the current file is archived before the next flush.
    pub max_bytes: u64,
    /// Buffered line count that triggers a flush; `0` disables it.
    pub eager_flush_lines: usize,
    /// Upper bound on buffered lines regardless of `eager_flush_lines`.
    pub bulk_flush_lines: usize,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_MAX_BYTES,
            eager_flush_lines: DEFAULT_EAGER_FLUSH_LINES,
            bulk_flush_lines: DEFAULT_BULK_FLUSH_LINES,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppendOptions {
    pub flush: bool,
    pub fsync: bool,
}

impl AppendOptions {
    pub const BUFFERED: Self = Self {
        flush: false,
        fsync: false,
    };
    pub const DURABLE: Self = Self {
        flush: true,
        fsync: true,
    };
}

#[derive(Debug)]
pub struct JsonlWriter {
    path: PathBuf,
    options: WriterOptions,
    buffer: Vec<String>,
    rotations: u64,
}

impl JsonlWriter {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, options: WriterOptions) -> Self {
        Self {
            path: path.into(),
            options,
            buffer: Vec::new(),
            rotations: 0,
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Number of rotations performed by this writer instance.
    #[must_use]
    pub fn rotations(&self) -> u64 {
        self.rotations
    }

    /// Serializes `record` into the buffer, stamping a `timestamp` field on
    /// objects that lack one.
    pub fn append<T: Serialize>(&mut self, record: &T, opts: AppendOptions) -> Result<()> {
        let mut value = serde_json::to_value(record).context("failed to encode log record")?;
        if let Value::Object(map) = &mut value {
            if !map.contains_key("timestamp") {
                let stamp = format_rfc3339(now_utc()).map_err(anyhow::Error::from)?;
                map.insert("timestamp".to_string(), Value::String(stamp));
            }
        }

        let line = serde_json::to_string(&value).context("failed to serialize log record")?;
        self.buffer.push(line);

        if opts.flush || opts.fsync || self.should_auto_flush() {
            self.flush(opts.fsync)?;
        }
        Ok(())
    }

    /// Writes buffered lines to the current file, rotating first when the
    /// file has outgrown `max_bytes`. A partial last line left by a crash is
    /// truncated before anything new is written.
    pub fn flush(&mut self, fsync: bool) -> Result<()> {
        if self.buffer.is_empty() && !fsync {
            return Ok(());
        }

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create log directory {}", parent.display())
                })?;
            }
        }

        self.truncate_torn_tail()?;
        self.rotate_if_needed()?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open log file {}", self.path.display()))?;

        let mut payload = String::new();
        for line in &self.buffer {
            payload.push_str(line);
            payload.push('\n');
        }
        file.write_all(payload.as_bytes())
            .with_context(|| format!("failed to write log file {}", self.path.display()))?;
        if fsync {
            file.sync_all()
                .with_context(|| format!("failed to fsync log file {}", self.path.display()))?;
        }

        debug!(
            path = %self.path.display(),
            lines = self.buffer.len(),
            fsync,
            "flushed log buffer"
        );
        self.buffer.clear();
        Ok(())
    }

    /// Parses every line of the current file followed by the still-buffered
    /// lines. Malformed lines are skipped with a warning.
    pub fn read_all<T: DeserializeOwned>(&self) -> Result<Vec<T>> {
        let body = match fs::read_to_string(&self.path) {
            Ok(body) => body,
            Err(err) if err.kind() == ErrorKind::NotFound => String::new(),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read log file {}", self.path.display()))
            }
        };

        let mut records = Vec::new();
        let persisted = body.lines().enumerate().map(|(idx, line)| (idx + 1, line));
        let buffered = self
            .buffer
            .iter()
            .enumerate()
            .map(|(idx, line)| (idx + 1, line.as_str()));

        for (line_no, line) in persisted {
            if let Some(record) = self.parse_line(line_no, line, "file") {
                records.push(record);
            }
        }
        for (line_no, line) in buffered {
            if let Some(record) = self.parse_line(line_no, line, "buffer") {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Rotated archives of this log, oldest first.
    pub fn archives(&self) -> Result<Vec<PathBuf>> {
        let Some(dir) = self.path.parent() else {
            return Ok(Vec::new());
        };
        let dir = if dir.as_os_str().is_empty() {
            Path::new(".")
        } else {
            dir
        };

        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to list log directory {}", dir.display()))
            }
        };

        let (stem, ext) = self.stem_and_ext();
        let prefix = format!("{stem}-");
        let suffix = format!(".{ext}");
        let mut archives = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(middle) = name
                .strip_prefix(&prefix)
                .and_then(|rest| rest.strip_suffix(&suffix))
            else {
                continue;
            };
            // `<millis>` or `<millis>-<attempt>` when a rotation shared the millisecond.
            let (millis, attempt) = middle.split_once('-').unwrap_or((middle, "0"));
            if let (Ok(millis), Ok(attempt)) = (millis.parse::<u128>(), attempt.parse::<u32>()) {
                archives.push((millis, attempt, entry.path()));
            }
        }
        archives.sort();
        Ok(archives.into_iter().map(|(_, _, path)| path).collect())
    }

    /// Copies the current file next to itself as `<stem>.<label>-<millis>.<ext>`.
    /// Returns `None` when there is no current file.
    pub fn copy_current(&self, label: &str) -> Result<Option<PathBuf>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let (stem, ext) = self.stem_and_ext();
        let target = self
            .path
            .with_file_name(format!("{stem}.{label}-{}.{ext}", unix_millis()));
        fs::copy(&self.path, &target).with_context(|| {
            format!(
                "failed to copy {} to {}",
                self.path.display(),
                target.display()
            )
        })?;
        Ok(Some(target))
    }

    /// Atomically replaces the current file with `lines`, dropping anything
    /// still buffered. Reserved for corruption-recovery truncation.
    pub fn replace_contents(&mut self, lines: &[String]) -> Result<()> {
        self.buffer.clear();
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let tmp_path = self.path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp_path)
                .with_context(|| format!("failed to create {}", tmp_path.display()))?;
            for line in lines {
                file.write_all(line.as_bytes())?;
                file.write_all(b"\n")?;
            }
            file.sync_all()
                .with_context(|| format!("failed to fsync {}", tmp_path.display()))?;
        }
        fs::rename(&tmp_path, &self.path).with_context(|| {
            format!(
                "failed to move {} into place at {}",
                tmp_path.display(),
                self.path.display()
            )
        })?;
        Ok(())
    }

    fn should_auto_flush(&self) -> bool {
        let pending = self.buffer.len();
        (self.options.eager_flush_lines > 0 && pending >= self.options.eager_flush_lines)
            || pending >= self.options.bulk_flush_lines.max(1)
    }

    /// Archives the current file when it has outgrown `max_bytes`.
    pub fn rotate_if_needed(&mut self) -> Result<Option<PathBuf>> {
        let size = match fs::metadata(&self.path) {
            Ok(metadata) => metadata.len(),
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to stat log file {}", self.path.display()))
            }
        };
        if size <= self.options.max_bytes {
            return Ok(None);
        }

        let (stem, ext) = self.stem_and_ext();
        let millis = unix_millis();
        let mut archive = self.path.with_file_name(format!("{stem}-{millis}.{ext}"));
        let mut attempt = 1_u32;
        while archive.exists() {
            archive = self
                .path
                .with_file_name(format!("{stem}-{millis}-{attempt}.{ext}"));
            attempt += 1;
        }

        fs::rename(&self.path, &archive).with_context(|| {
            format!(
                "failed to rotate {} to {}",
                self.path.display(),
                archive.display()
            )
        })?;
        self.rotations += 1;
        info!(
            path = %self.path.display(),
            archive = %archive.display(),
            size_bytes = size,
            max_bytes = self.options.max_bytes,
            "rotated log file"
        );
        Ok(Some(archive))
    }

    /// Cuts the current file back to its last complete line.
    fn truncate_torn_tail(&self) -> Result<Option<u64>> {
        let mut file = match OpenOptions::new().read(true).write(true).open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to open log file {}", self.path.display()))
            }
        };
        let len = file
            .metadata()
            .with_context(|| format!("failed to stat log file {}", self.path.display()))?
            .len();
        if len == 0 {
            return Ok(None);
        }

        let mut last = [0_u8; 1];
        file.seek(SeekFrom::End(-1))?;
        file.read_exact(&mut last)?;
        if last[0] == b'\n' {
            return Ok(None);
        }

        let mut body = Vec::new();
        file.seek(SeekFrom::Start(0))?;
        file.read_to_end(&mut body)
            .with_context(|| format!("failed to read log file {}", self.path.display()))?;
        let keep = body
            .iter()
            .rposition(|byte| *byte == b'\n')
            .map_or(0, |idx| idx + 1);
        let keep = u64::try_from(keep).context("log file offset out of range")?;

        warn!(
            path = %self.path.display(),
            dropped_bytes = len - keep,
            "truncating torn tail from log file"
        );
        file.set_len(keep)
            .with_context(|| format!("failed to truncate log file {}", self.path.display()))?;
        file.sync_all()
            .with_context(|| format!("failed to fsync log file {}", self.path.display()))?;
        Ok(Some(len - keep))
    }

    fn parse_line<T: DeserializeOwned>(
        &self,
        line_no: usize,
        line: &str,
        origin: &str,
    ) -> Option<T> {
        if line.trim().is_empty() {
            return None;
        }
        match serde_json::from_str::<T>(line) {
            Ok(record) => Some(record),
            Err(err) => {
                warn!(
                    path = %self.path.display(),
                    line = line_no,
                    origin,
                    error = %err,
                    "skipping malformed log line"
                );
                None
            }
        }
    }

    fn stem_and_ext(&self) -> (String, String) {
        let stem = self
            .path
            .file_stem()
            .map_or_else(|| "log".to_string(), |s| s.to_string_lossy().to_string());
        let ext = self
            .path
            .extension()
            .map_or_else(|| "jsonl".to_string(), |s| s.to_string_lossy().to_string());
        (stem, ext)
    }
}

impl Drop for JsonlWriter {
    fn drop(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        if let Err(err) = self.flush(false) {
            warn!(
                path = %self.path.display(),
                pending = self.buffer.len(),
                error = %err,
                "failed to flush log buffer on drop"
            );
        }
    }
}

fn unix_millis() -> i128 {
    now_utc().unix_timestamp_nanos() / 1_000_000
}
