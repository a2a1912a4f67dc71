use crate::stream::feed::{FeedConsumer, Notifier};
use crate::stream::transport::{EventHandler, HandlerControl, HandlerId, SocketEvent, Transport};
use crate::stream::types::CloseInfo;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::warn;

/// Callbacks the lifecycle controller receives from an attached session.
pub trait SessionObserver: Send + Sync {
    fn transport_opened(&self);

    fn first_message(&self);

    fn transport_closed(&self, close: &CloseInfo);
}

/// Proof that handlers are attached to a transport. Consumed by
/// [`SubscriptionManager::detach`], so the same set cannot be detached twice.
#[must_use = "dropping the token leaves the handlers attached"]
#[derive(Debug)]
pub struct SubscriptionToken {
    feed: HandlerId,
    first_message: HandlerId,
    error: HandlerId,
    status: HandlerId,
}

pub struct SubscriptionManager {
    consumer: Arc<dyn FeedConsumer>,
    notifier: Arc<dyn Notifier>,
}

impl SubscriptionManager {
    pub fn new(consumer: Arc<dyn FeedConsumer>, notifier: Arc<dyn Notifier>) -> Self {
        Self { consumer, notifier }
    }

    pub fn attach(
        &self,
        transport: &Arc<dyn Transport>,
        observer: Arc<dyn SessionObserver>,
    ) -> SubscriptionToken {
        let hub = transport.events();

        let consumer = Arc::clone(&self.consumer);
        let feed = hub.subscribe(EventHandler::Message(Arc::new(move |message| {
            consumer.on_message(message);
            HandlerControl::Keep
        })));

        let fired = AtomicBool::new(false);
        let first_observer = Arc::clone(&observer);
        let first_message = hub.subscribe(EventHandler::Message(Arc::new(move |message| {
            if !message.is_text() {
                return HandlerControl::Keep;
            }
            if !fired.swap(true, Ordering::AcqRel) {
                first_observer.first_message();
            }
            HandlerControl::Remove
        })));

        let notifier = Arc::clone(&self.notifier);
        let source: Weak<dyn Transport> = Arc::downgrade(transport);
        let error = hub.subscribe(EventHandler::Error(Arc::new(move |text| {
            let connected = source
                .upgrade()
                .map(|transport| transport.is_connected())
                .unwrap_or(false);
            if connected {
                warn!(error = %text, "feed transport error");
                notifier.notify(text);
            }
        })));

        let status = hub.subscribe(EventHandler::Status(Arc::new(move |event| match event {
            SocketEvent::Opened => observer.transport_opened(),
            SocketEvent::Closed(close) => observer.transport_closed(close),
        })));

        SubscriptionToken {
            feed,
            first_message,
            error,
            status,
        }
    }

    pub fn detach(&self, transport: &dyn Transport, token: SubscriptionToken) {
        let hub = transport.events();
        // The first-message handler is usually gone already.
        for id in [token.status, token.error, token.first_message, token.feed] {
            hub.unsubscribe(id);
        }
    }
}
