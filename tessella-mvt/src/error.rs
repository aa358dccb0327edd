use thiserror::Error;

/// Error produced while decoding a vector tile.
#[derive(Debug, Clone, Error)]
pub enum MvtError {
    #[error("protobuf error: {0}")]
    Proto(String),

    #[error("malformed tile: {0}")]
    Malformed(String),
}

impl From<prost::DecodeError> for MvtError {
    fn from(value: prost::DecodeError) -> Self {
        Self::Proto(value.to_string())
    }
}
