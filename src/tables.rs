//! Tabular input and output.
//!
//! Every table is a CSV file with one header row. Headers are normalised on
//! read (trimmed, lowercased, spaces → `_`) so exports that spell a column
//! `Ticket ID` and `ticket_id` deserialize into the same field.
//!
//! Audit logs are opened in append mode: the header is written only when
//! the file is new or empty, so a resumed pass extends the log it left.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use csv::{ReaderBuilder, StringRecord, Writer, WriterBuilder};
use serde::de::DeserializeOwned;
use serde::Serialize;

fn normalise_header(h: &str) -> String {
    h.trim()
        .trim_start_matches('\u{feff}')
        .to_lowercase()
        .replace([' ', '-'], "_")
}

/// Read every row of `path`.
pub fn read_table<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let mut reader = ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("Failed to open table: {}", path.display()))?;
    let headers: StringRecord = reader
        .headers()
        .with_context(|| format!("Failed to read header of {}", path.display()))?
        .iter()
        .map(normalise_header)
        .collect();
    reader.set_headers(headers.clone());

    let mut rows = Vec::new();
    for (i, record) in reader.records().enumerate() {
        let record =
            record.with_context(|| format!("{}: malformed row {}", path.display(), i + 2))?;
        let row: T = record
            .deserialize(Some(&headers))
            .with_context(|| format!("{}: cannot decode row {}", path.display(), i + 2))?;
        rows.push(row);
    }
    Ok(rows)
}

/// Read `path`, or return no rows when the file does not exist.
pub fn read_optional_table<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    if path.exists() {
        read_table(path)
    } else {
        Ok(Vec::new())
    }
}

/// Read a table that a pass cannot run without.
pub fn read_required_table<T: DeserializeOwned>(path: &Path, produced_by: &str) -> Result<Vec<T>> {
    if !path.exists() {
        anyhow::bail!(
            "Missing required table {} (run the '{}' pass first)",
            path.display(),
            produced_by
        );
    }
    read_table(path)
}

/// Number of data rows in `path`, or `None` if it does not exist.
pub fn count_rows(path: &Path) -> Result<Option<usize>> {
    if !path.exists() {
        return Ok(None);
    }
    let mut reader = ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("Failed to open table: {}", path.display()))?;
    let mut n = 0;
    for record in reader.records() {
        record.with_context(|| format!("{}: malformed row", path.display()))?;
        n += 1;
    }
    Ok(Some(n))
}

/// Row-at-a-time CSV writer, flushed after every row so an interrupted
/// pass leaves a complete log behind.
pub struct TableWriter {
    path: PathBuf,
    writer: Writer<File>,
    rows: usize,
}

impl TableWriter {
    /// Create or truncate `path`.
    pub fn create(path: &Path) -> Result<Self> {
        Self::open(path, false)
    }

    /// Open `path` for appending, writing the header only if the file is
    /// new or empty.
    pub fn append(path: &Path) -> Result<Self> {
        Self::open(path, true)
    }

    fn open(path: &Path, append: bool) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let has_rows = append && fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(path)
            .with_context(|| format!("Failed to open {} for writing", path.display()))?;
        let writer = WriterBuilder::new().has_headers(!has_rows).from_writer(file);
        Ok(Self {
            path: path.to_path_buf(),
            writer,
            rows: 0,
        })
    }

    pub fn write<T: Serialize>(&mut self, row: &T) -> Result<()> {
        self.writer
            .serialize(row)
            .with_context(|| format!("Failed to write row to {}", self.path.display()))?;
        self.writer
            .flush()
            .with_context(|| format!("Failed to flush {}", self.path.display()))?;
        self.rows += 1;
        Ok(())
    }

    /// Rows written through this writer (not counting earlier appends).
    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Write all `rows` to `path`, replacing its contents.
pub fn write_table<T: Serialize>(path: &Path, rows: &[T]) -> Result<()> {
    let mut writer = TableWriter::create(path)?;
    for row in rows {
        writer.write(row)?;
    }
    Ok(())
}
