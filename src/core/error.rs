use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Extraction error: {0}")]
    Extraction(String),

    #[error("Digest error: {0}")]
    Digest(String),

    #[error("Pattern error: {0}")]
    Pattern(#[from] regex::Error),

    #[error("Watch error: {0}")]
    Watch(String),

    #[error("Another scan or refresh is already running")]
    Busy,

    #[error("Operation cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, Error>;
