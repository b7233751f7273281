use thiserror::Error;

#[derive(Debug, Error)]
pub enum BlockgateError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("storage unavailable: {0}")]
    Storage(String),

    #[error("invalid rule '{id}': {message}")]
    InvalidRule { id: String, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

pub type BlockgateResult<T> = Result<T, BlockgateError>;
