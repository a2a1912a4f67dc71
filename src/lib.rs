mod error;
mod logger;
mod state;
pub mod stream;

pub use error::AppError;
pub use logger::init_tracing;
pub use stream::{
    ChannelFeedConsumer, ConnectionState, FeedMessage, LinkArgs, LinkConfig, StaticEndpointResolver,
    StreamLink, TracingNotifier, WebSocketTransportFactory,
};

use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const STATUS_INTERVAL: Duration = Duration::from_secs(30);

/// Connects to `FEED_ENDPOINT`, counts frames and shuts down on Ctrl-C.
pub async fn run() -> Result<(), AppError> {
    init_tracing();

    let config = LinkArgs::from_env()?.normalize()?;
    let resolver = StaticEndpointResolver::from_env()?;
    let (consumer, mut frames) = ChannelFeedConsumer::new();
    let link = StreamLink::new(
        config,
        Arc::new(resolver),
        Arc::new(WebSocketTransportFactory),
        Arc::new(consumer),
        Arc::new(TracingNotifier),
    );
    link.connect().await?;

    let mut text_frames: u64 = 0;
    let mut binary_frames: u64 = 0;
    let mut status_timer = tokio::time::interval(STATUS_INTERVAL);
    status_timer.tick().await;

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(error) = signal {
                    warn!(%error, "failed to listen for ctrl-c; shutting down");
                }
                break;
            }
            frame = frames.recv() => match frame {
                Some(FeedMessage::Text(_)) => text_frames += 1,
                Some(FeedMessage::Binary(_)) => binary_frames += 1,
                Some(FeedMessage::Ping(_)) => {}
                None => break,
            },
            _ = status_timer.tick() => {
                let status = link.status().await;
                info!(
                    state = ?status.state,
                    retry_attempt = status.retry_attempt,
                    text_frames,
                    binary_frames,
                    "feed status"
                );
            }
        }
    }

    link.close().await;
    info!(text_frames, binary_frames, "feed link shut down");
    Ok(())
}
