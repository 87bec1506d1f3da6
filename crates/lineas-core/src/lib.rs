//! Lineas Core - Foundation crate for the lineas harvester.
//!
//! This crate provides shared types, error handling and configuration
//! management that the browser backend and the harvester depend on.
//!
//! # Modules
//!
//! - [`error`] - Central error types using thiserror
//! - [`config`] - TOML-based configuration with XDG paths and env overrides
//! - [`types`] - Work keys, extracted records and per-key bookkeeping
//!
//! # Example
//!
//! ```rust
//! use lineas_core::{HarvestConfig, RucKey};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = HarvestConfig::default();
//! config.validate()?;
//!
//! let key = RucKey::new("20100047218")?;
//! assert_eq!(key.as_str().len(), 11);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

pub mod config;
pub mod error;
pub mod types;

// Re-export commonly used types
pub use config::{
    BandwidthConfig, BrowserConfig, HarvestConfig, HarvestSettings, LookupConfig, OutputConfig,
    PacingConfig, ProxyConfig,
};
pub use error::{ConfigError, ConfigResult, LineasError, Result};
pub use types::{ExtractedLine, FailureKind, ResultRow, RucKey, WorkRecord, WorkStatus};
