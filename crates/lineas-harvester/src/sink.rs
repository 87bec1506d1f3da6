//! Result and failure output files.
//!
//! Rows are buffered in memory and merged by key; every flush rewrites the
//! whole file atomically, so flushing twice never duplicates a key.

use crate::error::Result;
use crate::persist::{atomic_write, strip_bom, UTF8_BOM};
use csv::StringRecord;
use lineas_core::{ExtractedLine, FailureKind, OutputConfig, ResultRow, RucKey};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

/// Longest error message kept in `failed_rucs.csv`.
pub const MAX_MESSAGE_CHARS: usize = 200;

const FAILURE_HEADERS: [&str; 4] = ["RUC", "Error_Type", "Error_Message", "Attempts"];

/// A key that ended in failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureRow {
    pub key: RucKey,
    pub error_kind: FailureKind,
    pub message: String,
    pub attempts: u32,
}

/// Rows kept in insertion order with O(1) replace-by-key.
#[derive(Debug)]
struct KeyedRows<T> {
    rows: Vec<T>,
    index: HashMap<RucKey, usize>,
}

impl<T> Default for KeyedRows<T> {
    fn default() -> Self {
        Self {
            rows: Vec::new(),
            index: HashMap::new(),
        }
    }
}

impl<T> KeyedRows<T> {
    fn upsert(&mut self, key: RucKey, row: T) {
        match self.index.get(&key) {
            Some(&i) => self.rows[i] = row,
            None => {
                self.index.insert(key, self.rows.len());
                self.rows.push(row);
            }
        }
    }

    fn contains(&self, key: &RucKey) -> bool {
        self.index.contains_key(key)
    }

    fn remove(&mut self, key: &RucKey, key_of: impl Fn(&T) -> &RucKey) {
        if let Some(i) = self.index.remove(key) {
            self.rows.remove(i);
            for row in &self.rows[i..] {
                if let Some(slot) = self.index.get_mut(key_of(row)) {
                    *slot -= 1;
                }
            }
        }
    }

    fn len(&self) -> usize {
        self.rows.len()
    }
}

pub struct ResultSink {
    results_path: PathBuf,
    failures_path: PathBuf,
    results: KeyedRows<ResultRow>,
    failures: KeyedRows<FailureRow>,
    dirty: bool,
}

impl ResultSink {
    /// Open the sink, loading whatever a previous run left in the output directory.
    pub fn open(output: &OutputConfig) -> Result<Self> {
        let mut sink = Self {
            results_path: output.path(&output.results_file),
            failures_path: output.path(&output.failed_file),
            results: KeyedRows::default(),
            failures: KeyedRows::default(),
            dirty: false,
        };

        for row in read_results(&sink.results_path)? {
            sink.results.upsert(row.key.clone(), row);
        }
        for row in read_failures(&sink.failures_path)? {
            if !sink.results.contains(&row.key) {
                sink.failures.upsert(row.key.clone(), row);
            }
        }

        if sink.results.len() + sink.failures.len() > 0 {
            tracing::info!(
                "Loaded {} existing results and {} failures",
                sink.results.len(),
                sink.failures.len()
            );
        }
        Ok(sink)
    }

    /// Buffer a successful result. Replaces an earlier failure of the same key.
    pub fn append(&mut self, row: ResultRow) {
        self.failures.remove(&row.key, |f| &f.key);
        self.results.upsert(row.key.clone(), row);
        self.dirty = true;
    }

    /// Buffer a terminal failure. Ignored if the key already has a result.
    pub fn append_failure(&mut self, row: FailureRow) {
        if self.results.contains(&row.key) {
            return;
        }
        self.failures.upsert(row.key.clone(), row);
        self.dirty = true;
    }

    /// Write both files if anything changed since the last flush.
    pub fn flush(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }

        atomic_write(&self.results_path, &render_results(&self.results.rows)?)?;
        atomic_write(&self.failures_path, &render_failures(&self.failures.rows)?)?;
        self.dirty = false;

        tracing::debug!(
            results = self.results.len(),
            failures = self.failures.len(),
            "Result sink flushed"
        );
        Ok(())
    }

    /// Keys already recorded as succeeded or failed.
    #[must_use]
    pub fn known_keys(&self) -> HashSet<RucKey> {
        self.results
            .index
            .keys()
            .chain(self.failures.index.keys())
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn result_count(&self) -> usize {
        self.results.len()
    }

    #[must_use]
    pub fn failure_count(&self) -> usize {
        self.failures.len()
    }

    #[must_use]
    pub fn result(&self, key: &RucKey) -> Option<&ResultRow> {
        self.results.index.get(key).map(|&i| &self.results.rows[i])
    }

    #[must_use]
    pub fn failure(&self, key: &RucKey) -> Option<&FailureRow> {
        self.failures.index.get(key).map(|&i| &self.failures.rows[i])
    }

    #[must_use]
    pub fn results_path(&self) -> &Path {
        &self.results_path
    }
}

fn render_results(rows: &[ResultRow]) -> Result<Vec<u8>> {
    let groups = rows.iter().map(|r| r.lines.len()).max().unwrap_or(0).max(1);

    let mut buffer = UTF8_BOM.to_vec();
    {
        let mut writer = csv::Writer::from_writer(&mut buffer);

        let mut header = vec!["RUC".to_string()];
        for n in 1..=groups {
            header.push(format!("Modalidad_{n}"));
            header.push(format!("Numero_Telefonico_{n}"));
            header.push(format!("Empresa_Operadora_{n}"));
        }
        writer.write_record(&header)?;

        for row in rows {
            let mut fields = Vec::with_capacity(1 + groups * 3);
            fields.push(row.key.as_str());
            for line in &row.lines {
                fields.push(line.modality.as_str());
                fields.push(line.phone_number.as_str());
                fields.push(line.operator_name.as_str());
            }
            fields.resize(1 + groups * 3, "");
            writer.write_record(&fields)?;
        }
        writer.flush()?;
    }
    Ok(buffer)
}

fn render_failures(rows: &[FailureRow]) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    {
        let mut writer = csv::Writer::from_writer(&mut buffer);
        writer.write_record(FAILURE_HEADERS)?;
        for row in rows {
            writer.write_record([
                row.key.as_str(),
                row.error_kind.as_str(),
                truncate_chars(&row.message, MAX_MESSAGE_CHARS),
                row.attempts.to_string().as_str(),
            ])?;
        }
        writer.flush()?;
    }
    Ok(buffer)
}

fn truncate_chars(message: &str, max: usize) -> &str {
    match message.char_indices().nth(max) {
        Some((end, _)) => &message[..end],
        None => message,
    }
}

fn read_csv(path: &Path) -> Result<Option<Vec<StringRecord>>> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(strip_bom(&raw));
    let records = reader.records().collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(Some(records))
}

fn read_results(path: &Path) -> Result<Vec<ResultRow>> {
    let Some(records) = read_csv(path)? else {
        return Ok(Vec::new());
    };

    let mut rows = Vec::with_capacity(records.len());
    for record in records {
        let Ok(key) = RucKey::new(record.get(0).unwrap_or_default().trim()) else {
            tracing::warn!("Skipping unreadable row in {}", path.display());
            continue;
        };

        let fields: Vec<&str> = record.iter().skip(1).collect();
        let lines = fields
            .chunks(3)
            .filter(|group| group.iter().any(|f| !f.trim().is_empty()))
            .map(|group| ExtractedLine {
                modality: group.first().copied().unwrap_or_default().to_string(),
                phone_number: group.get(1).copied().unwrap_or_default().to_string(),
                operator_name: group.get(2).copied().unwrap_or_default().to_string(),
            })
            .collect();

        rows.push(ResultRow { key, lines });
    }
    Ok(rows)
}

fn read_failures(path: &Path) -> Result<Vec<FailureRow>> {
    let Some(records) = read_csv(path)? else {
        return Ok(Vec::new());
    };

    let mut rows = Vec::with_capacity(records.len());
    for record in records {
        let Ok(key) = RucKey::new(record.get(0).unwrap_or_default().trim()) else {
            tracing::warn!("Skipping unreadable row in {}", path.display());
            continue;
        };
        rows.push(FailureRow {
            key,
            error_kind: record
                .get(1)
                .and_then(|kind| kind.parse().ok())
                .unwrap_or(FailureKind::Unknown),
            message: record.get(2).unwrap_or_default().to_string(),
            attempts: record
                .get(3)
                .and_then(|n| n.trim().parse().ok())
                .unwrap_or_default(),
        });
    }
    Ok(rows)
}
