//! End-of-run performance report.

use crate::error::Result;
use crate::governor::BandwidthSnapshot;
use crate::persist::atomic_write_json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

const BYTES_PER_KB: f64 = 1024.0;
const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Why a run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Backlog drained
    Completed,
    /// The governor refused a fetch
    BandwidthExhausted,
    /// Too many consecutive transport failures
    ProxyExhausted,
    /// Shutdown requested by the caller
    Interrupted,
}

impl StopReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::BandwidthExhausted => "bandwidth_exhausted",
            Self::ProxyExhausted => "proxy_exhausted",
            Self::Interrupted => "interrupted",
        }
    }

    fn priority(self) -> u8 {
        match self {
            Self::BandwidthExhausted | Self::ProxyExhausted => 2,
            Self::Interrupted => 1,
            Self::Completed => 0,
        }
    }

    /// Keep the more important of two reasons; the first one wins a tie.
    #[must_use]
    pub fn merge(current: Option<Self>, new: Self) -> Self {
        match current {
            Some(current) if current.priority() >= new.priority() => current,
            _ => new,
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timing {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub total_seconds: f64,
    pub total_duration: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyStats {
    pub total: usize,
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub remaining: usize,
    pub success_rate: f64,
    /// Phone lines extracted across succeeded keys
    pub lines: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Speed {
    pub per_minute: f64,
    pub per_hour: f64,
    pub per_worker_per_hour: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BandwidthStats {
    pub used_mb: f64,
    pub remaining_mb: f64,
    pub avg_kb_per_key: f64,
    pub estimated_keys_remaining: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerStats {
    pub count: usize,
}

/// Structured summary written to `performance_report.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceReport {
    pub timing: Timing,
    pub keys: KeyStats,
    pub speed: Speed,
    pub bandwidth: BandwidthStats,
    pub workers: WorkerStats,
    pub errors_by_type: BTreeMap<String, u64>,
    pub retry_count: u64,
    pub finish_reason: StopReason,
}

/// Raw run figures the report is computed from.
#[derive(Debug, Clone)]
pub struct RunFigures {
    pub started: DateTime<Utc>,
    pub finished: DateTime<Utc>,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub remaining: usize,
    pub lines: usize,
    pub bandwidth: BandwidthSnapshot,
    pub worker_count: usize,
    pub errors_by_type: BTreeMap<String, u64>,
    pub retries: u64,
    pub reason: StopReason,
}

impl PerformanceReport {
    #[allow(clippy::cast_precision_loss)]
    #[must_use]
    pub fn from_figures(figures: RunFigures) -> Self {
        let elapsed = (figures.finished - figures.started)
            .to_std()
            .unwrap_or_default();
        let seconds = elapsed.as_secs_f64();
        let processed = figures.succeeded + figures.failed;

        let per_minute = if seconds > 0.0 {
            processed as f64 / (seconds / 60.0)
        } else {
            0.0
        };
        let per_hour = per_minute * 60.0;

        Self {
            timing: Timing {
                start: figures.started,
                end: figures.finished,
                total_seconds: round2(seconds),
                total_duration: format_duration(elapsed.as_secs()),
            },
            keys: KeyStats {
                total: figures.total,
                processed,
                succeeded: figures.succeeded,
                failed: figures.failed,
                remaining: figures.remaining,
                success_rate: if processed > 0 {
                    round2(figures.succeeded as f64 / processed as f64 * 100.0)
                } else {
                    0.0
                },
                lines: figures.lines,
            },
            speed: Speed {
                per_minute: round2(per_minute),
                per_hour: round2(per_hour),
                per_worker_per_hour: round2(per_hour / figures.worker_count.max(1) as f64),
            },
            bandwidth: BandwidthStats {
                used_mb: round2(figures.bandwidth.consumed as f64 / BYTES_PER_MB),
                remaining_mb: round2(figures.bandwidth.remaining as f64 / BYTES_PER_MB),
                avg_kb_per_key: if processed > 0 {
                    round2(figures.bandwidth.consumed as f64 / BYTES_PER_KB / processed as f64)
                } else {
                    0.0
                },
                estimated_keys_remaining: figures.bandwidth.estimated_keys_remaining,
            },
            workers: WorkerStats {
                count: figures.worker_count,
            },
            errors_by_type: figures.errors_by_type,
            retry_count: figures.retries,
            finish_reason: figures.reason,
        }
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        atomic_write_json(path, self)
    }

    /// Emit the report as one summary line.
    pub fn log(&self) {
        tracing::info!(
            reason = %self.finish_reason,
            duration = %self.timing.total_duration,
            processed = self.keys.processed,
            succeeded = self.keys.succeeded,
            failed = self.keys.failed,
            remaining = self.keys.remaining,
            lines = self.keys.lines,
            success_rate = self.keys.success_rate,
            per_hour = self.speed.per_hour,
            used_mb = self.bandwidth.used_mb,
            avg_kb_per_key = self.bandwidth.avg_kb_per_key,
            keys_left_in_budget = self.bandwidth.estimated_keys_remaining,
            workers = self.workers.count,
            retries = self.retry_count,
            "Run finished"
        );
        for (kind, count) in &self.errors_by_type {
            tracing::info!(kind = %kind, count, "Errors by type");
        }
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn format_duration(total_secs: u64) -> String {
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}
