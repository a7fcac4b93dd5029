use thiserror::Error;

/// Reasons a feed payload cannot become a working-set record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PayloadError {
    #[error("payload is missing required field `{0}`")]
    MissingField(&'static str),
    #[error("payload is not valid JSON: {0}")]
    InvalidJson(String),
}

impl From<serde_json::Error> for PayloadError {
    fn from(value: serde_json::Error) -> Self {
        Self::InvalidJson(value.to_string())
    }
}
