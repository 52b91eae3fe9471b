use thiserror::Error;

#[derive(Error, Debug)]
pub enum MossError {
    #[error("Kubernetes error: {0}")]
    KubernetesError(String),

    #[error("{kind} watch failed {failures} times in a row: {last_error}")]
    WatchFailed {
        kind: &'static str,
        failures: u32,
        last_error: String,
    },

    #[error("Directory not ready after {0:?}")]
    NotReady(std::time::Duration),

    #[error("Metrics error: {0}")]
    MetricsError(String),

    #[error("Ingestion error: {0}")]
    IngestError(String),

    #[error("{0} already started")]
    AlreadyStarted(&'static str),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<prometheus::Error> for MossError {
    fn from(e: prometheus::Error) -> Self {
        MossError::MetricsError(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, MossError>;
