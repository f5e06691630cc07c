use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("changeset decode error at byte {offset}: {reason}")]
    Decode { offset: usize, reason: String },

    #[error("changeset encode error: {0}")]
    Encode(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid resolution code: {0}")]
    InvalidResolution(i64),

    #[error("invalid data: {0}")]
    InvalidData(String),
}

impl CoreError {
    pub(crate) fn decode(offset: usize, reason: impl Into<String>) -> Self {
        Self::Decode {
            offset,
            reason: reason.into(),
        }
    }

    pub fn is_decode(&self) -> bool {
        matches!(self, Self::Decode { .. })
    }
}
