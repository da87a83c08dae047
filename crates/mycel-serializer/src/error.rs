use mycel_keys::KeyError;
use thiserror::Error;

/// Errors produced by the value envelope layer.
#[derive(Debug, Error)]
pub enum ValueError {
    /// Malformed wire header or payload framing.
    #[error("wire error: {0}")]
    Wire(String),

    /// Envelope decryption failed or no keystore was available.
    #[error("crypto error: {0}")]
    Crypto(String),

    /// The decoded shape does not fit the requested target.
    #[error("type error: {0}")]
    Type(String),

    /// A plain body was requested as an encrypted companion type.
    #[error("InvalidTypeForPlainBody: {0}")]
    InvalidTypeForPlainBody(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error(transparent)]
    Key(#[from] KeyError),
}

impl From<ciborium::de::Error<std::io::Error>> for ValueError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        ValueError::Codec(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for ValueError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        ValueError::Codec(e.to_string())
    }
}

pub type ValueResult<T> = Result<T, ValueError>;
