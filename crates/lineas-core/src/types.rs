//! Shared types used across the lineas harvester.
//!
//! This module defines the work key newtype, the extracted record shapes and
//! the per-key bookkeeping record owned by the orchestrator.

use crate::error::LineasError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

/// Newtype for RUC tax identifiers.
///
/// A RUC is exactly 11 ASCII digits. Once constructed the value never changes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RucKey(String);

impl RucKey {
    /// Create a new `RucKey` from an exact 11-digit string.
    ///
    /// # Errors
    /// Returns error if the value is not exactly 11 digits.
    pub fn new(value: impl Into<String>) -> Result<Self, LineasError> {
        let value = value.into();
        Self::validate(&value)?;
        Ok(Self(value))
    }

    /// Parse a raw input cell, dropping any non-digit characters first.
    ///
    /// Spreadsheet exports routinely wrap identifiers in quotes, spaces or
    /// dashes; those are discarded before validation.
    ///
    /// # Errors
    /// Returns error if the remaining digits are not exactly 11.
    pub fn parse_lenient(raw: &str) -> Result<Self, LineasError> {
        let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
        if digits.is_empty() {
            return Err(LineasError::Validation(format!(
                "invalid RUC: no digits in '{}'",
                raw.trim()
            )));
        }
        Self::new(digits)
    }

    /// Get the inner string value.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(value: &str) -> Result<(), LineasError> {
        static RUC_REGEX: OnceLock<Regex> = OnceLock::new();
        let regex = RUC_REGEX.get_or_init(|| Regex::new(r"^[0-9]{11}$").expect("valid regex"));

        if regex.is_match(value) {
            Ok(())
        } else {
            Err(LineasError::Validation(format!(
                "invalid RUC: must be exactly 11 digits, got '{value}'"
            )))
        }
    }
}

impl fmt::Display for RucKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One registered phone line for a RUC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedLine {
    /// Service modality (prepaid, postpaid, ...)
    pub modality: String,
    /// Phone number as shown by the registry
    pub phone_number: String,
    /// Operator company name
    pub operator_name: String,
}

/// All lines found for one key. An empty `lines` is a valid terminal result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultRow {
    /// The looked-up key
    pub key: RucKey,
    /// Extracted lines in page order
    pub lines: Vec<ExtractedLine>,
}

/// Lifecycle status of a key in the backlog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    /// Waiting in the queue
    Pending,
    /// Assigned to a worker
    InProgress,
    /// Terminal: extraction completed
    Succeeded,
    /// Terminal: retries exhausted or non-retryable failure
    Failed,
}

impl WorkStatus {
    /// Whether the status is terminal.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// Per-key bookkeeping record owned by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkRecord {
    /// The key being processed
    pub key: RucKey,
    /// Current lifecycle status
    pub status: WorkStatus,
    /// Number of failed attempts so far
    pub attempts: u32,
}

impl WorkRecord {
    /// Create a fresh pending record.
    #[must_use]
    pub fn pending(key: RucKey) -> Self {
        Self {
            key,
            status: WorkStatus::Pending,
            attempts: 0,
        }
    }
}

/// Classification of a failed fetch, used for retry decisions and reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Page or selector wait timed out
    Timeout,
    /// Proxy refused or dropped the connection
    ProxyError,
    /// Navigation failed
    PageLoadError,
    /// Expected form element never appeared
    SelectorNotFound,
    /// Browser process or target died
    BrowserCrash,
    /// Site throttled or blocked us
    RateLimited,
    /// Session could not be used
    SessionError,
    /// Anything else
    Unknown,
}

impl FailureKind {
    /// Stable snake_case label, matching the serde representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::ProxyError => "proxy_error",
            Self::PageLoadError => "page_load_error",
            Self::SelectorNotFound => "selector_not_found",
            Self::BrowserCrash => "browser_crash",
            Self::RateLimited => "rate_limited",
            Self::SessionError => "session_error",
            Self::Unknown => "unknown",
        }
    }

    /// Whether the failure counts toward the consecutive proxy error streak.
    #[must_use]
    pub fn is_transport(self) -> bool {
        matches!(self, Self::ProxyError | Self::PageLoadError | Self::Timeout)
    }
}

impl FailureKind {
    /// Every kind, in declaration order.
    pub const ALL: [Self; 8] = [
        Self::Timeout,
        Self::ProxyError,
        Self::PageLoadError,
        Self::SelectorNotFound,
        Self::BrowserCrash,
        Self::RateLimited,
        Self::SessionError,
        Self::Unknown,
    ];
}

impl std::str::FromStr for FailureKind {
    type Err = LineasError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| LineasError::Validation(format!("unknown failure kind '{s}'")))
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
