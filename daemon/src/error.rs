use std::fmt;

use png::EncodingError;

/// Errors surfaced by the daemon's own plumbing (config, persistence, startup).
#[derive(Debug)]
pub enum MinusError {
    Config(String),
    Io(std::io::Error),
    Http(reqwest::Error),
    ImageEncoding(String),
}

impl fmt::Display for MinusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MinusError::Config(err) => write!(f, "{err}"),
            MinusError::Io(err) => write!(f, "Filesystem error: {err}"),
            MinusError::Http(err) => write!(f, "HTTP error: {err}"),
            MinusError::ImageEncoding(err) => write!(f, "Failed to encode image: {err}"),
        }
    }
}

impl std::error::Error for MinusError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MinusError::Io(err) => Some(err),
            MinusError::Http(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for MinusError {
    fn from(value: std::io::Error) -> Self {
        MinusError::Io(value)
    }
}

impl From<reqwest::Error> for MinusError {
    fn from(value: reqwest::Error) -> Self {
        MinusError::Http(value)
    }
}

impl From<EncodingError> for MinusError {
    fn from(value: EncodingError) -> Self {
        MinusError::ImageEncoding(value.to_string())
    }
}
