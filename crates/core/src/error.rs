use thiserror::Error;

#[derive(Debug, Error)]
pub enum TraceLiteError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("unauthorized: {0}")]
    Auth(String),

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("shutdown: {0}")]
    Shutdown(String),
}

pub type Result<T> = std::result::Result<T, TraceLiteError>;
