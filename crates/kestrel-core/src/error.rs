use thiserror::Error;

#[derive(Debug, Error)]
pub enum KestrelError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid conversation log: {0}")]
    InvalidLog(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl KestrelError {
    /// Short error code string for logs and operator diagnostics.
    pub fn code(&self) -> &'static str {
        match self {
            KestrelError::Config(_) => "CONFIG_ERROR",
            KestrelError::InvalidLog(_) => "INVALID_LOG",
            KestrelError::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, KestrelError>;
