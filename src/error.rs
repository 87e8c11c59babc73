use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Model deserialization error: {0}")]
    Deserialization(#[from] bincode::Error),

    #[error("Cascade description error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid cascade model: {0}")]
    ModelLoad(String),

    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Classifier has no model loaded")]
    EmptyClassifier,

    #[error("Candidate buffer overflow: {found} candidates found, capacity is {capacity}")]
    CapacityExceeded { found: usize, capacity: usize },

    #[error("Worker pool failure: {0}")]
    Accelerator(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub(crate) fn model(msg: impl Into<String>) -> Self {
        Self::ModelLoad(msg.into())
    }
}
