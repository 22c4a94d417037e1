use thiserror::Error as ThisError;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the informer, cache and mutation layers.
///
/// Payloads are plain strings so a single failure can be handed to every
/// awaiter of a shared fetch.
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
pub enum Error {
    #[error("discovery failed: {0}")]
    Discovery(String),
    #[error("unrecognized API version and kind: {api_version} {kind}")]
    UnrecognizedResource { api_version: String, kind: String },
    #[error("required property kind is not set")]
    MissingKind,
    #[error("required property name is not set ({action} {kind})")]
    MissingName { action: String, kind: String },
    #[error("not found: {identity}")]
    NotFound { identity: String },
    #[error("store destroyed")]
    StoreDestroyed,
    #[error("transport error{}: {message}", .status.map(|s| format!(" ({s})")).unwrap_or_default())]
    Transport { status: Option<u16>, message: String },
    #[error("decode error: {0}")]
    Decode(String),
    #[error("cancelled")]
    Cancelled,
}

impl Error {
    pub fn transport(message: impl Into<String>) -> Self { Error::Transport { status: None, message: message.into() } }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. } | Error::Transport { status: Some(404), .. })
    }
}
