use lineas_core::FailureKind;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BrowserError>;

#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("chromium error: {0}")]
    ChromiumError(String),

    #[error("navigation failed: {0}")]
    NavigationError(String),

    #[error("selector not found: {0}")]
    SelectorNotFound(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("script evaluation failed: {0}")]
    ScriptError(String),
}

/// Failure of one fetch, as seen by the harvester.
///
/// Bandwidth exhaustion and interrupts are not represented here: they are
/// global conditions, never a property of a single key.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    /// Retryable failure (timeout, proxy hiccup, blocked page).
    #[error("{kind}: {message}")]
    Transient { kind: FailureKind, message: String },

    /// The browser session is unusable and must be rotated.
    #[error("session unusable: {0}")]
    Session(String),
}

impl FetchError {
    pub fn transient(kind: FailureKind, message: impl Into<String>) -> Self {
        Self::Transient {
            kind,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Transient { kind, .. } => *kind,
            Self::Session(_) => FailureKind::SessionError,
        }
    }

    #[must_use]
    pub fn is_session(&self) -> bool {
        matches!(self, Self::Session(_))
    }
}

/// Classify a raw automation error message.
#[must_use]
pub fn classify_message(message: &str) -> FailureKind {
    let lower = message.to_lowercase();

    if lower.contains("timeout") || lower.contains("timed out") {
        FailureKind::Timeout
    } else if lower.contains("proxy") || lower.contains("connect") {
        FailureKind::ProxyError
    } else if lower.contains("selector") || lower.contains("element") {
        FailureKind::SelectorNotFound
    } else if lower.contains("navigation") || lower.contains("net::") {
        FailureKind::PageLoadError
    } else if lower.contains("crash") || lower.contains("target closed") {
        FailureKind::BrowserCrash
    } else if lower.contains("429") || lower.contains("rate") || lower.contains("banned") {
        FailureKind::RateLimited
    } else {
        FailureKind::Unknown
    }
}

impl From<BrowserError> for FetchError {
    fn from(err: BrowserError) -> Self {
        match err {
            BrowserError::Timeout(msg) => Self::transient(FailureKind::Timeout, msg),
            BrowserError::SelectorNotFound(msg) => {
                Self::transient(FailureKind::SelectorNotFound, msg)
            }
            BrowserError::NavigationError(msg) => {
                let kind = match classify_message(&msg) {
                    FailureKind::Unknown => FailureKind::PageLoadError,
                    kind => kind,
                };
                Self::transient(kind, msg)
            }
            BrowserError::ChromiumError(msg) | BrowserError::ScriptError(msg) => {
                match classify_message(&msg) {
                    FailureKind::BrowserCrash => Self::Session(msg),
                    kind => Self::transient(kind, msg),
                }
            }
        }
    }
}
