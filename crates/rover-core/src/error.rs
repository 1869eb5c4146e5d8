//! Error taxonomy for the bridge core.
//!
//! Streaming-path errors (`TransportError`, `DecodeError`) never leave the
//! pipeline; they are logged and turned into availability changes. Only the
//! configuration coordinator returns failures to its caller.

use thiserror::Error;

/// Setup-time failure: bad endpoint, invalid throttle rate, schema violation.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigurationError {
    #[error("malformed endpoint `{input}`: {reason}")]
    Endpoint { input: String, reason: String },
    #[error("invalid rate {rate_hz} Hz: {reason}")]
    Rate { rate_hz: f64, reason: &'static str },
    #[error("invalid interval for `{name}`: {reason}")]
    Interval { name: String, reason: &'static str },
    #[error("topic `{topic}` assigned to both `{first}` and `{second}`")]
    DuplicateTopic {
        topic: String,
        first: String,
        second: String,
    },
    #[error("resource `{0}` is already scheduled")]
    DuplicateResource(String),
    #[error("http client setup failed: {0}")]
    Client(String),
    #[error("config file error: {0}")]
    File(String),
    #[error("config schema violation: {0}")]
    Schema(String),
}

/// Connection-level failure; always answered with a reconnect.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(std::time::Duration),
    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("peer silent for {0:?}")]
    Heartbeat(std::time::Duration),
    #[error("connection closed by peer")]
    Closed,
    #[error("io error: {0}")]
    Io(String),
}

/// Malformed inbound envelope or resource body.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DecodeError {
    #[error("frame is not valid json: {0}")]
    Json(String),
    #[error("envelope is not an object")]
    NotObject,
    #[error("envelope missing string `name`")]
    MissingName,
    #[error("envelope missing `payload`")]
    MissingPayload,
}

/// One failed poll; retried on the next tick.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PollError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("unexpected status {0}")]
    Status(u16),
    #[error("decode failed: {0}")]
    Decode(String),
}

/// Failure reported by a remote configuration document store.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum StoreError {
    /// The document changed underneath us (409/412 or version mismatch).
    #[error("write conflict: {0}")]
    Conflict(String),
    #[error("unexpected status {0}")]
    Status(u16),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("decode failed: {0}")]
    Decode(String),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }
}

/// Result of a caller-initiated configuration change.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CoordinatorError {
    #[error("fetching `{resource}` failed after {attempts} attempts: {source}")]
    Fetch {
        resource: String,
        attempts: u32,
        #[source]
        source: StoreError,
    },
    #[error("writing `{resource}` failed after {attempts} attempts: {source}")]
    Write {
        resource: String,
        attempts: u32,
        #[source]
        source: StoreError,
    },
    #[error("`{resource}` kept changing during {attempts} write attempts")]
    ConflictExhausted { resource: String, attempts: u32 },
    #[error("patch for `{resource}` must be a JSON object")]
    InvalidPatch { resource: String },
    #[error("write cycle for `{resource}` aborted: {reason}")]
    Aborted { resource: String, reason: String },
}

impl From<PollError> for StoreError {
    fn from(err: PollError) -> Self {
        match err {
            PollError::Request(msg) => StoreError::Transport(msg),
            PollError::Status(code) => StoreError::Status(code),
            PollError::Decode(msg) => StoreError::Decode(msg),
        }
    }
}
