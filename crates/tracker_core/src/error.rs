use thiserror::Error;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("invalid shipments endpoint '{endpoint}': {source}")]
    InvalidEndpoint {
        endpoint: String,
        source: url::ParseError,
    },
    #[error("shipments request failed: {0}")]
    Request(#[source] reqwest::Error),
    #[error("shipments endpoint returned status {0}")]
    Status(reqwest::StatusCode),
    #[error("shipments response could not be decoded: {0}")]
    Decode(#[source] reqwest::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StompError {
    #[error("unknown STOMP command '{0}'")]
    UnknownCommand(String),
    #[error("malformed STOMP header line '{0}'")]
    MalformedHeader(String),
    #[error("invalid escape sequence in STOMP header '{0}'")]
    InvalidEscape(String),
    #[error("invalid content-length '{0}'")]
    InvalidContentLength(String),
    #[error("STOMP frame is not terminated")]
    Incomplete,
    #[error("STOMP frame is not valid UTF-8")]
    InvalidUtf8,
}
