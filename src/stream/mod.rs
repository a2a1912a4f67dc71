pub mod feed;
pub mod lifecycle;
pub mod retry;
pub mod subscription;
pub mod tls;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use feed::{
    ChannelFeedConsumer, ChannelNotifier, EndpointResolver, FeedConsumer, Notifier,
    StaticEndpointResolver, TracingNotifier,
};
pub use lifecycle::StreamLink;
pub use retry::RetryController;
pub use subscription::{SessionObserver, SubscriptionManager, SubscriptionToken};
pub use transport::{
    EventHub, SocketEvent, Transport, TransportFactory, WebSocketTransport,
    WebSocketTransportFactory,
};
pub use types::{
    CloseInfo, CloseKind, ConnectMode, ConnectionState, FeedMessage, LinkArgs, LinkConfig,
    LinkStatusSnapshot, ReadyState, TlsPolicy,
};

pub const NOTICE_CONNECTING: &str = "Connecting...";
pub const NOTICE_CLOSING: &str = "Closing connection!";
pub const NOTICE_DISCONNECTED: &str = "Disconnected!";
