use tokio_tungstenite::tungstenite;

#[derive(Debug, thiserror::Error)]
pub enum RealtimeError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] Box<tungstenite::Error>),

    #[error("connection refused: {0}")]
    Refused(String),

    #[error("connection closed")]
    Closed,

    #[error("invalid realtime url {0:?}")]
    InvalidUrl(String),
}
