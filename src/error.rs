use thiserror::Error;

#[derive(Error, Debug)]
pub enum CloudArcError {
    #[error("Invalid configuration: {description}")]
    InvalidConfig { description: String },

    #[error("Source I/O error for {path}")]
    SourceIo {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Encryption error: {description}")]
    Crypto { description: String },

    #[error("Transient backend error: {description}")]
    BackendTransient { description: String },

    #[error("Backend error: {description}")]
    BackendPermanent { description: String },

    #[error("Pipeline error in {stage}: {description}")]
    Pipeline { stage: String, description: String },

    #[error("I/O error")]
    IoError {
        #[source]
        source: std::io::Error,
    },

    #[error("Operation cancelled")]
    Cancelled,
}

impl CloudArcError {
    /// Whether a failed backend call may be retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, CloudArcError::BackendTransient { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, CloudArcError::Cancelled)
    }
}

impl From<std::io::Error> for CloudArcError {
    fn from(source: std::io::Error) -> Self {
        CloudArcError::IoError { source }
    }
}

pub type Result<T> = std::result::Result<T, CloudArcError>;
