use std::path::PathBuf;

/// Failures surfaced by the gateway core.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// The catalog has no item for the requested identifier.
    #[error("{0}")]
    MetadataNotFound(String),

    /// A catalog, feed or search call failed.
    #[error("provider fetch failed: {0}")]
    Provider(String),

    /// Spawn failure, non-zero exit or broken output stream of the acquisition process.
    #[error("acquisition failed: {0}")]
    Acquisition(String),

    /// The live sink refused a chunk. Only ever logged.
    #[error("live sink rejected chunk: {0}")]
    SinkWrite(String),

    #[error("filesystem error at {}: {source}", path.display())]
    Filesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A cache was read before any refresh ever succeeded.
    #[error("no data available for {0}")]
    CacheEmpty(&'static str),
}

impl GatewayError {
    pub fn filesystem(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Filesystem {
            path: path.into(),
            source,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::MetadataNotFound(_))
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        Self::Provider(err.to_string())
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;
