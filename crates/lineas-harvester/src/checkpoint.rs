//! Durable record of the remaining backlog.
//!
//! The input CSV itself is the checkpoint: each snapshot rewrites it to hold
//! only keys that are not yet terminal, keeping every original column. Run
//! metadata goes to `checkpoint.json` next to the results.

use crate::error::{HarvestError, Result};
use crate::persist::{
    atomic_create, atomic_write, atomic_write_json, durable_copy, strip_bom, UTF8_BOM,
};
use crate::report::StopReason;
use chrono::{DateTime, Local, Utc};
use csv::StringRecord;
use lineas_core::{OutputConfig, RucKey};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

/// Why an input row was not loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// The value is not an 11-digit key
    InputFormatError(String),
    /// The key already appeared on an earlier row
    Duplicate,
}

impl RejectReason {
    fn label(&self) -> &str {
        match self {
            Self::InputFormatError(_) => "input_format_error",
            Self::Duplicate => "duplicate",
        }
    }

    fn detail(&self) -> &str {
        match self {
            Self::InputFormatError(detail) => detail,
            Self::Duplicate => "key already listed on an earlier row",
        }
    }
}

/// An input row skipped at load time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedInput {
    pub line: u64,
    pub raw_value: String,
    pub reason: RejectReason,
}

/// Result of loading the input backlog.
#[derive(Debug, Clone, Default)]
pub struct PendingInput {
    /// Valid, de-duplicated keys in input order
    pub keys: Vec<RucKey>,
    pub rejected: Vec<RejectedInput>,
}

/// Counters stored alongside each snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunStats {
    pub succeeded: usize,
    pub failed: usize,
    pub consumed_bytes: u64,
    /// Set on the final snapshot of a run
    pub stop_reason: Option<StopReason>,
}

/// Contents of `checkpoint.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub generation: u64,
    pub timestamp: DateTime<Utc>,
    pub input: PathBuf,
    pub remaining: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub consumed_bytes: u64,
    pub stop_reason: Option<StopReason>,
}

pub struct CheckpointStore {
    input_path: PathBuf,
    meta_path: PathBuf,
    rejected_path: PathBuf,
    backup_dir: PathBuf,
    had_bom: bool,
    headers: Option<StringRecord>,
    rows: Vec<(RucKey, StringRecord)>,
    generation: u64,
    backed_up: bool,
}

impl CheckpointStore {
    /// Open the store for `input_path`, continuing the generation count of a previous run.
    pub fn open(input_path: impl Into<PathBuf>, output: &OutputConfig) -> Result<Self> {
        let input_path = input_path.into();
        if !input_path.is_file() {
            return Err(HarvestError::input(&input_path, "file not found"));
        }

        let meta_path = output.path(&output.checkpoint_file);
        let generation = previous_generation(&meta_path);
        if generation > 0 {
            tracing::info!("Resuming from checkpoint generation {}", generation);
        }

        Ok(Self {
            input_path,
            meta_path,
            rejected_path: output.path(&output.rejected_file),
            backup_dir: output.backup_dir(),
            had_bom: false,
            headers: None,
            rows: Vec::new(),
            generation,
            backed_up: false,
        })
    }

    #[must_use]
    pub fn input_path(&self) -> &Path {
        &self.input_path
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Read the pending keys from the input file.
    ///
    /// The first call of a run writes a timestamped backup of the input and
    /// records rejected rows. Re-reading a drained input yields only what is left.
    pub fn load_pending(&mut self) -> Result<PendingInput> {
        let raw = fs::read(&self.input_path)?;

        if !self.backed_up {
            self.write_backup(&raw)?;
            self.backed_up = true;
        }

        self.had_bom = raw.starts_with(UTF8_BOM);
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(strip_bom(&raw));

        let headers = reader.headers()?.clone();
        let column = key_column(&headers);

        let mut seen = HashSet::new();
        let mut pending = PendingInput::default();
        self.rows.clear();

        for record in reader.records() {
            let record = record?;
            let line = record.position().map_or(0, csv::Position::line);
            let raw_value = record.get(column).unwrap_or_default().trim().to_string();

            if record.iter().all(|field| field.trim().is_empty()) {
                continue;
            }

            match RucKey::parse_lenient(&raw_value) {
                Ok(key) if seen.insert(key.clone()) => {
                    pending.keys.push(key.clone());
                    self.rows.push((key, record));
                }
                Ok(_) => pending.rejected.push(RejectedInput {
                    line,
                    raw_value,
                    reason: RejectReason::Duplicate,
                }),
                Err(e) => pending.rejected.push(RejectedInput {
                    line,
                    raw_value,
                    reason: RejectReason::InputFormatError(e.to_string()),
                }),
            }
        }
        self.headers = Some(headers);

        if !pending.rejected.is_empty() {
            tracing::warn!(
                "{} input rows rejected, see {}",
                pending.rejected.len(),
                self.rejected_path.display()
            );
            self.write_rejected(&pending.rejected)?;
        }

        tracing::info!(
            "Loaded {} pending keys from {}",
            pending.keys.len(),
            self.input_path.display()
        );
        Ok(pending)
    }

    /// Rewrite the input to hold exactly `remaining`, then record run metadata.
    pub fn snapshot(&mut self, remaining: &HashSet<RucKey>, stats: &RunStats) -> Result<u64> {
        let Some(headers) = &self.headers else {
            return Err(HarvestError::input(
                &self.input_path,
                "snapshot requested before input was loaded",
            ));
        };

        let mut buffer = Vec::new();
        if self.had_bom {
            buffer.extend_from_slice(UTF8_BOM);
        }
        {
            let mut writer = csv::WriterBuilder::new()
                .flexible(true)
                .from_writer(&mut buffer);
            writer.write_record(headers)?;
            for (key, record) in &self.rows {
                if remaining.contains(key) {
                    writer.write_record(record)?;
                }
            }
            writer.flush()?;
        }

        let prev = previous_copy_path(&self.input_path);
        durable_copy(&self.input_path, &prev)?;
        atomic_write(&self.input_path, &buffer)?;

        self.rows.retain(|(key, _)| remaining.contains(key));
        self.generation += 1;

        let meta = CheckpointMeta {
            generation: self.generation,
            timestamp: Utc::now(),
            input: self.input_path.clone(),
            remaining: self.rows.len(),
            succeeded: stats.succeeded,
            failed: stats.failed,
            consumed_bytes: stats.consumed_bytes,
            stop_reason: stats.stop_reason,
        };
        atomic_write_json(&self.meta_path, &meta)?;

        tracing::debug!(
            generation = self.generation,
            remaining = meta.remaining,
            "Checkpoint written"
        );
        Ok(self.generation)
    }

    fn write_backup(&self, raw: &[u8]) -> Result<()> {
        let stem = self
            .input_path
            .file_stem()
            .map_or_else(|| "input".into(), |s| s.to_string_lossy());
        let stamp = Local::now().format("%Y%m%d-%H%M%S").to_string();

        for n in 0u32.. {
            let name = if n == 0 {
                format!("{stem}.{stamp}.backup.csv")
            } else {
                format!("{stem}.{stamp}-{n}.backup.csv")
            };
            let path = self.backup_dir.join(name);
            if atomic_create(&path, raw)? {
                tracing::info!("Input backed up to {}", path.display());
                return Ok(());
            }
        }
        Ok(())
    }

    fn write_rejected(&self, rejected: &[RejectedInput]) -> Result<()> {
        let mut buffer = Vec::new();
        {
            let mut writer = csv::Writer::from_writer(&mut buffer);
            writer.write_record(["Line", "Value", "Reason", "Detail"])?;
            for row in rejected {
                writer.write_record([
                    row.line.to_string().as_str(),
                    row.raw_value.as_str(),
                    row.reason.label(),
                    row.reason.detail(),
                ])?;
            }
            writer.flush()?;
        }
        atomic_write(&self.rejected_path, &buffer)
    }
}

fn key_column(headers: &StringRecord) -> usize {
    headers
        .iter()
        .position(|h| h.trim().to_lowercase().contains("ruc"))
        .unwrap_or(0)
}

fn previous_copy_path(input: &Path) -> PathBuf {
    let mut name = input.file_name().unwrap_or_default().to_os_string();
    name.push(".prev");
    input.with_file_name(name)
}

fn previous_generation(meta_path: &Path) -> u64 {
    let Ok(contents) = fs::read(meta_path) else {
        return 0;
    };
    match serde_json::from_slice::<CheckpointMeta>(&contents) {
        Ok(meta) => meta.generation,
        Err(e) => {
            tracing::warn!("Ignoring unreadable {}: {}", meta_path.display(), e);
            0
        }
    }
}

/// Group rejected rows by reason, for logging.
#[must_use]
pub fn rejection_counts(rejected: &[RejectedInput]) -> HashMap<&str, usize> {
    let mut counts = HashMap::new();
    for row in rejected {
        *counts.entry(row.reason.label()).or_default() += 1;
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup(contents: &str) -> (TempDir, PathBuf, OutputConfig) {
        let tmp = TempDir::new().unwrap();
        let input = tmp.path().join("rucs.csv");
        fs::write(&input, contents).unwrap();
        let output = OutputConfig {
            dir: tmp.path().join("out"),
            ..OutputConfig::default()
        };
        (tmp, input, output)
    }

    fn key(s: &str) -> RucKey {
        RucKey::new(s).unwrap()
    }

    #[test]
    fn test_load_picks_ruc_column_and_rejects() {
        let (_tmp, input, output) = setup(
            "Empresa,RUC,Ciudad\n\
             Acme,20100047218,Lima\n\
             Beta,2010004721,Cusco\n\
             Gamma,20-100047218,Lima\n\
             Delta,20512345678,Piura\n",
        );
        let mut store = CheckpointStore::open(&input, &output).unwrap();
        let pending = store.load_pending().unwrap();

        assert_eq!(pending.keys, vec![key("20100047218"), key("20512345678")]);
        assert_eq!(pending.rejected.len(), 2);
        assert!(matches!(
            pending.rejected[0].reason,
            RejectReason::InputFormatError(_)
        ));
        assert_eq!(pending.rejected[0].line, 3);
        assert_eq!(pending.rejected[1].reason, RejectReason::Duplicate);

        let rejected = fs::read_to_string(output.path(&output.rejected_file)).unwrap();
        assert!(rejected.starts_with("Line,Value,Reason,Detail"));
        assert!(rejected.contains("duplicate"));

        let counts = rejection_counts(&pending.rejected);
        assert_eq!(counts["duplicate"], 1);
    }

    #[test]
    fn test_load_strips_bom_and_defaults_to_first_column() {
        let (_tmp, input, output) = setup("\u{feff}Documento,Nombre\n20100047218,Acme\n");
        let mut store = CheckpointStore::open(&input, &output).unwrap();
        let pending = store.load_pending().unwrap();
        assert_eq!(pending.keys, vec![key("20100047218")]);
    }

    #[test]
    fn test_snapshot_keeps_remaining_rows_and_columns() {
        let (_tmp, input, output) = setup(
            "RUC,Nombre\n20100047218,Acme\n20512345678,Beta\n20600000001,Gamma\n",
        );
        let mut store = CheckpointStore::open(&input, &output).unwrap();
        store.load_pending().unwrap();

        let remaining: HashSet<_> = [key("20600000001"), key("20100047218")].into();
        let generation = store.snapshot(&remaining, &RunStats::default()).unwrap();
        assert_eq!(generation, 1);

        let rewritten = fs::read_to_string(&input).unwrap();
        let lines: Vec<_> = rewritten.lines().collect();
        assert_eq!(lines, vec!["RUC,Nombre", "20100047218,Acme", "20600000001,Gamma"]);

        let prev = fs::read_to_string(previous_copy_path(&input)).unwrap();
        assert!(prev.contains("20512345678"));

        let meta: CheckpointMeta =
            serde_json::from_slice(&fs::read(output.path(&output.checkpoint_file)).unwrap())
                .unwrap();
        assert_eq!(meta.generation, 1);
        assert_eq!(meta.remaining, 2);
    }

    #[test]
    fn test_backup_written_once() {
        let (_tmp, input, output) = setup("RUC\n20100047218\n");
        let mut store = CheckpointStore::open(&input, &output).unwrap();
        store.load_pending().unwrap();
        store.load_pending().unwrap();

        let backups: Vec<_> = fs::read_dir(output.backup_dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(backups.len(), 1);
        assert!(backups[0].starts_with("rucs."));
        assert!(backups[0].ends_with(".backup.csv"));
    }

    #[test]
    fn test_backups_of_back_to_back_runs_are_kept() {
        let (_tmp, input, output) = setup("RUC\n20100047218\n20512345678\n");

        let mut first = CheckpointStore::open(&input, &output).unwrap();
        first.load_pending().unwrap();
        let remaining: HashSet<_> = [key("20512345678")].into();
        first.snapshot(&remaining, &RunStats::default()).unwrap();

        let mut second = CheckpointStore::open(&input, &output).unwrap();
        second.load_pending().unwrap();

        let mut backups: Vec<Vec<u8>> = fs::read_dir(output.backup_dir())
            .unwrap()
            .map(|e| fs::read(e.unwrap().path()).unwrap())
            .collect();
        backups.sort_by_key(Vec::len);
        assert_eq!(backups.len(), 2);
        assert_eq!(backups[1], b"RUC\n20100047218\n20512345678\n");
    }

    #[test]
    fn test_previous_copy_holds_prior_input() {
        let (_tmp, input, output) = setup("RUC\n20100047218\n20512345678\n");
        let mut store = CheckpointStore::open(&input, &output).unwrap();
        store.load_pending().unwrap();
        store
            .snapshot(&[key("20512345678")].into(), &RunStats::default())
            .unwrap();

        let prev = fs::read_to_string(previous_copy_path(&input)).unwrap();
        assert!(prev.contains("20100047218"));
        assert!(!fs::read_to_string(&input).unwrap().contains("20100047218"));
    }

    #[test]
    fn test_generation_continues_across_runs() {
        let (_tmp, input, output) = setup("RUC\n20100047218\n20512345678\n");

        let mut store = CheckpointStore::open(&input, &output).unwrap();
        store.load_pending().unwrap();
        let remaining: HashSet<_> = [key("20512345678")].into();
        store.snapshot(&remaining, &RunStats::default()).unwrap();
        store.snapshot(&remaining, &RunStats::default()).unwrap();

        let mut resumed = CheckpointStore::open(&input, &output).unwrap();
        assert_eq!(resumed.generation(), 2);
        let pending = resumed.load_pending().unwrap();
        assert_eq!(pending.keys, vec![key("20512345678")]);
        assert_eq!(resumed.snapshot(&HashSet::new(), &RunStats::default()).unwrap(), 3);
    }

    #[test]
    fn test_snapshot_before_load_is_an_error() {
        let (_tmp, input, output) = setup("RUC\n20100047218\n");
        let mut store = CheckpointStore::open(&input, &output).unwrap();
        assert!(store.snapshot(&HashSet::new(), &RunStats::default()).is_err());
    }

    #[test]
    fn test_missing_input() {
        let tmp = TempDir::new().unwrap();
        let result = CheckpointStore::open(tmp.path().join("absent.csv"), &OutputConfig::default());
        assert!(matches!(result, Err(HarvestError::Input { .. })));
    }
}
