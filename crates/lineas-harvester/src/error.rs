use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarvestError {
    /// A checkpoint, result or report write failed. Fatal for the run.
    #[error("failed to persist {}: {source}", path.display())]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid input {}: {reason}", path.display())]
    Input { path: PathBuf, reason: String },

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Browser error: {0}")]
    Browser(#[from] lineas_browser::BrowserError),

    #[error("Configuration error: {0}")]
    Config(#[from] lineas_core::ConfigError),
}

impl HarvestError {
    pub(crate) fn persistence(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Persistence {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn input(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Input {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, HarvestError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_persistence_display() {
        let err = HarvestError::persistence(
            "/tmp/out/resultados.csv",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert_eq!(
            err.to_string(),
            "failed to persist /tmp/out/resultados.csv: denied"
        );
    }

    #[test]
    fn test_input_display() {
        let err = HarvestError::input("rucs.csv", "file is empty");
        assert_eq!(err.to_string(), "invalid input rucs.csv: file is empty");
    }
}
