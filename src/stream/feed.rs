use crate::error::AppError;
use crate::stream::types::{FeedMessage, ENV_FEED_ENDPOINT};
use async_trait::async_trait;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::info;
use url::Url;

/// Supplies the feed URI. Failures are returned from `StreamLink::connect`.
#[async_trait]
pub trait EndpointResolver: Send + Sync {
    async fn feed_endpoint(&self) -> Result<Url, AppError>;
}

/// Receives every inbound frame once per frame per connection.
pub trait FeedConsumer: Send + Sync {
    fn on_message(&self, message: &FeedMessage);
}

/// Surfaces human readable status text. Implementations must not block.
pub trait Notifier: Send + Sync {
    fn notify(&self, text: &str);
}

#[derive(Debug, Clone)]
pub struct StaticEndpointResolver {
    endpoint: Url,
}

impl StaticEndpointResolver {
    pub fn new(endpoint: Url) -> Self {
        Self { endpoint }
    }

    pub fn parse(endpoint: &str) -> Result<Self, AppError> {
        Ok(Self::new(Url::parse(endpoint.trim())?))
    }

    pub fn from_env() -> Result<Self, AppError> {
        let endpoint = std::env::var(ENV_FEED_ENDPOINT)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .ok_or_else(|| {
                AppError::InvalidArgument(format!("{ENV_FEED_ENDPOINT} must be set"))
            })?;
        Self::parse(&endpoint)
    }
}

#[async_trait]
impl EndpointResolver for StaticEndpointResolver {
    async fn feed_endpoint(&self) -> Result<Url, AppError> {
        Ok(self.endpoint.clone())
    }
}

/// Forwards status text to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, text: &str) {
        info!(target: "market_stream_link::status", "{text}");
    }
}

/// Hands status text to a UI layer over a channel.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    sender: UnboundedSender<String>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, UnboundedReceiver<String>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&self, text: &str) {
        let _ = self.sender.send(text.to_string());
    }
}

/// Hands raw frames to a decoder over a channel.
#[derive(Debug, Clone)]
pub struct ChannelFeedConsumer {
    sender: UnboundedSender<FeedMessage>,
}

impl ChannelFeedConsumer {
    pub fn new() -> (Self, UnboundedReceiver<FeedMessage>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl FeedConsumer for ChannelFeedConsumer {
    fn on_message(&self, message: &FeedMessage) {
        let _ = self.sender.send(message.clone());
    }
}
