use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// More (stem, feature) pairs than the feature texture can address.
    #[error("feature capacity exceeded: {requested} features requested, at most {max} supported")]
    CapacityExceeded { requested: usize, max: usize },

    /// Precomputation was asked to run without loaded analysis or MIDI data.
    #[error("missing data: {0}")]
    MissingData(&'static str),

    #[error("invalid configuration: {0}")]
    ConfigurationInvalid(String),

    #[error("job failed: {0}")]
    JobFailed(String),

    /// Cooperative cancellation observed at a frame boundary.
    #[error("cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("MIDI parse error: {0}")]
    Midi(#[from] midly::Error),
}

impl Error {
    pub fn invalid<T: Into<String>>(msg: T) -> Self {
        Self::ConfigurationInvalid(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
