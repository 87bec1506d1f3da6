//! Lineas Harvester - Adaptive worker pool for bulk registry lookups.
//!
//! Takes a CSV of RUC keys, fans the lookups out over a pool of browser
//! sessions and keeps the run resumable: results are appended to the output
//! files and the input is rewritten to the keys still pending at every
//! checkpoint.
//!
//! # Features
//!
//! - Worker count and pacing derived from the host and the proxy latency
//! - Hard bandwidth cap enforced before every fetch
//! - Bounded retries with per-kind give-up rules
//! - Atomic checkpoints of results and the remaining input
//! - Structured performance report at the end of every run
//!
//! # Example
//!
//! ```rust,ignore
//! use lineas_browser::ChromiumBackend;
//! use lineas_harvester::Orchestrator;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! let config = Arc::new(HarvestConfig::load()?);
//! let backend = Arc::new(ChromiumBackend::new(&config)?);
//!
//! let summary = Orchestrator::new(config, backend)
//!     .run(Path::new("rucs.csv"), CancellationToken::new())
//!     .await?;
//! println!("stopped: {}", summary.stop_reason);
//! ```

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

pub mod backlog;
pub mod checkpoint;
pub mod error;
pub mod governor;
pub mod orchestrator;
mod persist;
pub mod profiler;
pub mod report;
pub mod retry;
pub mod sink;
pub mod worker;

pub use backlog::{Backlog, BacklogCounts};
pub use checkpoint::{CheckpointMeta, CheckpointStore, PendingInput, RejectReason, RejectedInput, RunStats};
pub use error::{HarvestError, Result};
pub use governor::{BandwidthGovernor, BandwidthSnapshot, Reservation};
pub use orchestrator::{Orchestrator, RunSummary};
pub use profiler::{derive_profile, HostFacts, ResourceProfile, MAX_WORKERS};
pub use report::{PerformanceReport, StopReason};
pub use retry::{RetryDecision, RetryPolicy};
pub use sink::{FailureRow, ResultSink};
pub use worker::{Outcome, Worker, WorkerReport};
