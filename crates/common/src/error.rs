use thiserror::Error;

#[derive(Debug, Error)]
pub enum QuotaError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

pub type QuotaResult<T> = Result<T, QuotaError>;
