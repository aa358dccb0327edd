use tessella_mvt::error::MvtError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TessellaError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to decode tile: {0}")]
    Decoding(#[from] MvtError),

    #[error("invalid stylesheet: {0}")]
    Style(String),

    #[error("http error: {0}")]
    Http(String),

    #[error("item not found")]
    NotFound,
}

impl From<reqwest::Error> for TessellaError {
    fn from(value: reqwest::Error) -> Self {
        Self::Http(value.to_string())
    }
}
