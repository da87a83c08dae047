use thiserror::Error;

/// Errors produced by the key layer.
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("config error: {0}")]
    Config(String),

    #[error("crypto error: {0}")]
    Crypto(String),
}

pub type KeyResult<T> = Result<T, KeyError>;
