use thiserror::Error;

/// Errors produced by the topic routing layer.
#[derive(Debug, Error)]
pub enum PathError {
    #[error("parse error: {0}")]
    Parse(String),

    #[error("binding error: {0}")]
    Binding(String),
}

pub type PathResult<T> = Result<T, PathError>;
