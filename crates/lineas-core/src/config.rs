//! Configuration management for lineas.
//!
//! Provides TOML-based configuration with XDG-compliant paths and
//! environment variable overrides. The resulting `HarvestConfig` is built once
//! at startup and handed to the orchestrator as an immutable value.

use crate::error::{ConfigError, ConfigResult};
use crate::types::FailureKind;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const BYTES_PER_KB: u64 = 1024;
const BYTES_PER_MB: u64 = 1024 * 1024;

/// Main harvester configuration.
///
/// Loaded from `~/.config/lineas/config.toml` (or platform equivalent) unless
/// an explicit path is given. Missing sections and fields fall back to defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HarvestConfig {
    /// Worker pool and retry policy
    pub harvest: HarvestSettings,
    /// Bandwidth budget
    pub bandwidth: BandwidthConfig,
    /// Host profiling and pacing fallbacks
    pub pacing: PacingConfig,
    /// Browser automation settings
    pub browser: BrowserConfig,
    /// Residential proxy endpoint
    pub proxy: ProxyConfig,
    /// Lookup service endpoints
    pub lookup: LookupConfig,
    /// Output file locations
    pub output: OutputConfig,
}

impl HarvestConfig {
    /// Load configuration from the XDG location, falling back to defaults if not found.
    pub fn load() -> ConfigResult<Self> {
        let config_path = Self::config_path()?;

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            tracing::debug!("Config file not found, using defaults");
            Ok(Self::default())
        }
    }

    /// Load configuration from an explicit path. The file must exist.
    pub fn load_from(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound {
                path: path.display().to_string(),
            });
        }
        tracing::debug!("Loading config from {}", path.display());
        let contents = fs::read_to_string(path)?;
        let config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration (explicit path or XDG default) with environment overrides.
    ///
    /// Supports the following environment variables:
    /// - `LINEAS_PROXY_USERNAME` / `LINEAS_PROXY_PASSWORD`: proxy credentials
    /// - `LINEAS_MAX_WORKERS`: manual worker cap
    /// - `LINEAS_BANDWIDTH_MB`: bandwidth cap in MB
    /// - `LINEAS_HEADLESS`: browser headless mode (true/false)
    /// - `LINEAS_OUTPUT_DIR`: output directory
    pub fn load_with_env(path: Option<&Path>) -> ConfigResult<Self> {
        let mut config = match path {
            Some(path) => Self::load_from(path)?,
            None => Self::load()?,
        };
        config.apply_env(|name| std::env::var(name).ok());
        Ok(config)
    }

    /// Apply `LINEAS_*` overrides using the given variable lookup.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = lookup("LINEAS_PROXY_USERNAME") {
            self.proxy.username = val;
            tracing::debug!("Override proxy.username from env");
        }

        if let Some(val) = lookup("LINEAS_PROXY_PASSWORD") {
            self.proxy.password = Some(val);
            tracing::debug!("Override proxy.password from env");
        }

        if let Some(val) = lookup("LINEAS_MAX_WORKERS") {
            if let Ok(workers) = val.parse() {
                self.harvest.max_workers = Some(workers);
                tracing::debug!("Override harvest.max_workers from env: {}", workers);
            }
        }

        if let Some(val) = lookup("LINEAS_BANDWIDTH_MB") {
            if let Ok(cap) = val.parse() {
                self.bandwidth.cap_mb = cap;
                tracing::debug!("Override bandwidth.cap_mb from env: {}", cap);
            }
        }

        if let Some(val) = lookup("LINEAS_HEADLESS") {
            if let Ok(headless) = val.parse() {
                self.browser.headless = headless;
                tracing::debug!("Override browser.headless from env: {}", headless);
            }
        }

        if let Some(val) = lookup("LINEAS_OUTPUT_DIR") {
            tracing::debug!("Override output.dir from env: {}", val);
            self.output.dir = PathBuf::from(val);
        }
    }

    /// Reject values the orchestrator cannot run with.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.harvest.max_retries == 0 {
            return Err(invalid("harvest.max_retries", "must be at least 1"));
        }
        if self.harvest.checkpoint_interval == 0 {
            return Err(invalid("harvest.checkpoint_interval", "must be at least 1"));
        }
        if self.harvest.max_workers == Some(0) {
            return Err(invalid("harvest.max_workers", "must be at least 1"));
        }
        if self.bandwidth.cap_mb == 0 && self.bandwidth.cap_bytes_override.is_none() {
            return Err(invalid("bandwidth.cap_mb", "must be greater than 0"));
        }
        if self.pacing.default_delay_min_ms > self.pacing.default_delay_max_ms {
            return Err(invalid(
                "pacing.default_delay_min_ms",
                "must not exceed pacing.default_delay_max_ms",
            ));
        }
        if self.pacing.ram_per_worker_gb <= 0.0 {
            return Err(invalid("pacing.ram_per_worker_gb", "must be positive"));
        }
        Ok(())
    }

    /// Get the path to the configuration file.
    ///
    /// Uses XDG base directories: `~/.config/lineas/config.toml`
    pub fn config_path() -> ConfigResult<PathBuf> {
        let dirs = ProjectDirs::from("pe", "lineas", "lineas").ok_or(ConfigError::NoConfigDir)?;
        Ok(dirs.config_dir().join("config.toml"))
    }
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

/// Worker pool, retry and checkpoint policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarvestSettings {
    /// Manual cap on the worker count (profiling may choose fewer)
    pub max_workers: Option<usize>,
    /// Maximum failed attempts per key before it is recorded as failed
    pub max_retries: u32,
    /// Failure kinds recorded as failed on first occurrence
    pub give_up_on: Vec<FailureKind>,
    /// Completions between checkpoints
    pub checkpoint_interval: usize,
    /// How long in-flight workers get to finish once shutdown starts
    pub shutdown_grace_secs: u64,
    /// Stagger worker start-up in waves
    pub stagger_start: bool,
}

impl HarvestSettings {
    /// Shutdown grace period as a `Duration`.
    #[must_use]
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

impl Default for HarvestSettings {
    fn default() -> Self {
        Self {
            max_workers: None,
            max_retries: 3,
            give_up_on: Vec::new(),
            checkpoint_interval: 25,
            shutdown_grace_secs: 30,
            stagger_start: true,
        }
    }
}

/// Bandwidth budget for one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BandwidthConfig {
    /// Cap in megabytes
    pub cap_mb: u64,
    /// Exact cap in bytes; takes precedence over `cap_mb` when set
    pub cap_bytes_override: Option<u64>,
    /// Per-fetch estimate used before enough samples exist
    pub estimated_kb_per_fetch: u64,
    /// Usage percentage that triggers a warning
    pub warn_percent: f64,
    /// Consecutive transport failures treated as proxy exhaustion (0 disables)
    pub max_consecutive_proxy_errors: u32,
}

impl BandwidthConfig {
    /// Cap in bytes.
    #[must_use]
    pub fn cap_bytes(&self) -> u64 {
        self.cap_bytes_override
            .unwrap_or_else(|| self.cap_mb.saturating_mul(BYTES_PER_MB))
    }

    /// Initial per-fetch estimate in bytes.
    #[must_use]
    pub fn estimated_bytes_per_fetch(&self) -> u64 {
        self.estimated_kb_per_fetch.saturating_mul(BYTES_PER_KB)
    }
}

impl Default for BandwidthConfig {
    fn default() -> Self {
        Self {
            cap_mb: 9_700,
            cap_bytes_override: None,
            estimated_kb_per_fetch: 550,
            warn_percent: 85.0,
            max_consecutive_proxy_errors: 10,
        }
    }
}

/// Host profiling parameters and pacing fallbacks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PacingConfig {
    /// Delay lower bound used when latency probing fails
    pub default_delay_min_ms: u64,
    /// Delay upper bound used when latency probing fails
    pub default_delay_max_ms: u64,
    /// Workers per physical core
    pub cpu_scaling_factor: f64,
    /// RAM budget per browser worker in GB
    pub ram_per_worker_gb: f64,
    /// Timeout for the whole latency probe
    pub probe_timeout_secs: u64,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            default_delay_min_ms: 1_000,
            default_delay_max_ms: 2_000,
            cpu_scaling_factor: 2.5,
            ram_per_worker_gb: 0.35,
            probe_timeout_secs: 15,
        }
    }
}

/// Browser automation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    /// Run browser in headless mode
    pub headless: bool,
    /// Block image loading (saves roughly 40% of the transfer)
    pub block_images: bool,
    /// Navigation timeout in seconds
    pub navigation_timeout_secs: u64,
    /// Upper bound for the result table to settle, in seconds
    pub result_timeout_secs: u64,
    /// Interval between row-count polls in milliseconds
    pub poll_interval_ms: u64,
    /// Consecutive equal row counts that mark the table as settled
    pub stable_polls: u32,
    /// Re-extractions when the table shows rows but none parse
    pub empty_result_rechecks: u32,
}

impl BrowserConfig {
    /// Navigation timeout as a `Duration`.
    #[must_use]
    pub fn navigation_timeout(&self) -> Duration {
        Duration::from_secs(self.navigation_timeout_secs)
    }

    /// Result wait bound as a `Duration`.
    #[must_use]
    pub fn result_timeout(&self) -> Duration {
        Duration::from_secs(self.result_timeout_secs)
    }

    /// Poll interval as a `Duration`.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            headless: true,
            block_images: true,
            navigation_timeout_secs: 120,
            result_timeout_secs: 60,
            poll_interval_ms: 2_000,
            stable_polls: 4,
            empty_result_rechecks: 4,
        }
    }
}

/// Residential proxy endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Proxy host
    pub host: String,
    /// Proxy port
    pub port: u16,
    /// Base username; a session suffix is appended per browser session
    pub username: String,
    /// Password (environment only, never written to disk)
    #[serde(skip)]
    pub password: Option<String>,
}

impl ProxyConfig {
    /// Whether credentials are present.
    #[must_use]
    pub fn is_configured(&self) -> bool {
        !self.host.is_empty() && !self.username.is_empty() && self.password.is_some()
    }

    /// `http://host:port` server address.
    #[must_use]
    pub fn server(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            host: "proxy.smartproxy.net".to_string(),
            port: 3120,
            username: String::new(),
            password: None,
        }
    }
}

/// Lookup service endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LookupConfig {
    /// Lookup form URL
    pub url: String,
    /// URLs fetched through the proxy to measure latency
    pub probe_urls: Vec<String>,
}

impl Default for LookupConfig {
    fn default() -> Self {
        Self {
            url: "https://checatuslineas.osiptel.gob.pe/".to_string(),
            probe_urls: vec![
                "https://www.google.com".to_string(),
                "https://www.cloudflare.com".to_string(),
                "https://api64.ipify.org".to_string(),
            ],
        }
    }
}

/// Output file locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Output directory
    pub dir: PathBuf,
    /// Results CSV file name
    pub results_file: String,
    /// Terminal failures CSV file name
    pub failed_file: String,
    /// Rejected input rows CSV file name
    pub rejected_file: String,
    /// Checkpoint metadata file name
    pub checkpoint_file: String,
    /// Performance report file name
    pub report_file: String,
    /// Backup directory; defaults to `<dir>/backups`
    pub backup_dir: Option<PathBuf>,
}

impl OutputConfig {
    /// Full path of a file inside the output directory.
    #[must_use]
    pub fn path(&self, file_name: &str) -> PathBuf {
        self.dir.join(file_name)
    }

    /// Resolved backup directory.
    #[must_use]
    pub fn backup_dir(&self) -> PathBuf {
        self.backup_dir
            .clone()
            .unwrap_or_else(|| self.dir.join("backups"))
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("lineas_output"),
            results_file: "resultados.csv".to_string(),
            failed_file: "failed_rucs.csv".to_string(),
            rejected_file: "rejected_rucs.csv".to_string(),
            checkpoint_file: "checkpoint.json".to_string(),
            report_file: "performance_report.json".to_string(),
            backup_dir: None,
        }
    }
}
