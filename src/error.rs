use serde::ser::Serializer;
use thiserror::Error;
use tokio_tungstenite::tungstenite;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("invalid feed endpoint: {0}")]
    InvalidEndpoint(#[from] url::ParseError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("websocket error: {0}")]
    WebSocket(Box<tungstenite::Error>),
    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),
    #[error("network error: {0}")]
    Network(String),
    #[error("stream link used before connect()")]
    NotInitialized,
    #[error("connection is not open")]
    Closed,
}

impl AppError {
    /// Network-level failures that the lifecycle retry loops absorb.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Io(_) | Self::Network(_) | Self::Closed => true,
            Self::WebSocket(error) => matches!(
                error.as_ref(),
                tungstenite::Error::Io(_)
                    | tungstenite::Error::Tls(_)
                    | tungstenite::Error::ConnectionClosed
                    | tungstenite::Error::AlreadyClosed
                    | tungstenite::Error::Http(_)
            ),
            Self::InvalidArgument(_)
            | Self::InvalidEndpoint(_)
            | Self::Tls(_)
            | Self::NotInitialized => false,
        }
    }
}

impl From<tungstenite::Error> for AppError {
    fn from(value: tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(value))
    }
}

impl serde::Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}
