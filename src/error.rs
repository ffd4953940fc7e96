use thiserror::Error;

pub type Result<T> = std::result::Result<T, ChatError>;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("message is empty")]
    EmptyMessage,

    /// No counterparty could be resolved, or the conversation was torn down.
    #[error("support unavailable")]
    Unavailable,

    #[error("not signed in")]
    NotSignedIn,

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("server returned no rows")]
    EmptyResponse,

    #[error("realtime channel: {0}")]
    Realtime(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error(transparent)]
    Url(#[from] url::ParseError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
