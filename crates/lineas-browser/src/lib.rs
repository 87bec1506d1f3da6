//! Lookup backend for the phone-line registry.
//!
//! Provides the [`LookupBackend`] capability consumed by the harvester and a
//! chromium implementation with proxy session rotation, fingerprint
//! randomisation and result-table extraction.

pub mod actions;
pub mod backend;
pub mod chromium;
pub mod engine;
pub mod error;
pub mod extract;
pub mod fingerprint;
pub mod proxy;

pub use actions::BrowserActions;
pub use backend::{FetchedPage, LookupBackend};
pub use chromium::{ChromiumBackend, ChromiumSession};
pub use engine::{BrowserEngine, EngineOptions};
pub use error::{classify_message, BrowserError, FetchError, Result};
pub use extract::{parse_results_table, TablePage, MAX_ROWS_PER_PAGE};
pub use fingerprint::FingerprintConfig;
pub use proxy::{ProxySession, ProxySessions};
