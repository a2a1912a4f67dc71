use crate::error::AppError;
use crate::state::{LinkState, RetryTaskHandle, RetryTaskKind};
use crate::stream::feed::{EndpointResolver, FeedConsumer, Notifier};
use crate::stream::retry::RetryController;
use crate::stream::subscription::{SessionObserver, SubscriptionManager};
use crate::stream::transport::{Transport, TransportFactory};
use crate::stream::types::{
    CloseInfo, CloseKind, ConnectionState, LinkConfig, LinkStatusSnapshot, CLOSE_NORMAL,
};
use crate::stream::{NOTICE_CLOSING, NOTICE_CONNECTING, NOTICE_DISCONNECTED};
use parking_lot::RwLock;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Owns the feed connection and drives it through app lifecycle signals.
///
/// Every public operation returns once its work has been dispatched; connect
/// attempts and reconnect loops run on background tasks that are cancelled by
/// the next lifecycle operation.
#[derive(Clone)]
pub struct StreamLink {
    inner: Arc<LinkInner>,
}

struct LinkInner {
    config: LinkConfig,
    resolver: Arc<dyn EndpointResolver>,
    factory: Arc<dyn TransportFactory>,
    notifier: Arc<dyn Notifier>,
    subscriptions: SubscriptionManager,
    retry: RetryController,
    machine: Mutex<LinkState>,
    transport: RwLock<Option<Arc<dyn Transport>>>,
    state: RwLock<ConnectionState>,
    generation: AtomicU64,
    first_message_received: AtomicBool,
}

struct LinkObserver {
    link: Weak<LinkInner>,
    generation: u64,
}

impl SessionObserver for LinkObserver {
    fn transport_opened(&self) {
        if let Some(link) = self.link.upgrade() {
            link.on_transport_opened(self.generation);
        }
    }

    fn first_message(&self) {
        if let Some(link) = self.link.upgrade() {
            link.on_first_message(self.generation);
        }
    }

    fn transport_closed(&self, close: &CloseInfo) {
        if let Some(link) = self.link.upgrade() {
            link.on_transport_closed(self.generation, close.clone());
        }
    }
}

fn millis(delay: Duration) -> u64 {
    delay.as_millis().min(u64::MAX as u128) as u64
}

impl StreamLink {
    pub fn new(
        config: LinkConfig,
        resolver: Arc<dyn EndpointResolver>,
        factory: Arc<dyn TransportFactory>,
        consumer: Arc<dyn FeedConsumer>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let retry = RetryController::from_config(&config);
        Self {
            inner: Arc::new(LinkInner {
                config,
                resolver,
                factory,
                subscriptions: SubscriptionManager::new(consumer, Arc::clone(&notifier)),
                notifier,
                retry,
                machine: Mutex::new(LinkState::default()),
                transport: RwLock::new(None),
                state: RwLock::new(ConnectionState::Idle),
                generation: AtomicU64::new(0),
                first_message_received: AtomicBool::new(false),
            }),
        }
    }

    /// Resolves the feed endpoint, installs a fresh transport and resumes.
    ///
    /// Endpoint and transport construction failures are returned; network
    /// failures are retried in the background.
    pub async fn connect(&self) -> Result<(), AppError> {
        let endpoint = self.inner.resolver.feed_endpoint().await?;
        let transport = self.inner.factory.create(&endpoint, &self.inner.config)?;

        let mut machine = self.inner.machine.lock().await;
        if let Some(previous) = self.inner.release_transport(&mut machine) {
            debug!("replacing feed transport");
            previous.close(CLOSE_NORMAL).await;
        }

        info!(endpoint = %endpoint, "connecting market feed");
        machine.endpoint = Some(endpoint);
        *self.inner.transport.write() = Some(transport);
        self.inner.resume(&mut machine)
    }

    pub async fn on_resume(&self) -> Result<(), AppError> {
        let mut machine = self.inner.machine.lock().await;
        self.inner.resume(&mut machine)
    }

    pub async fn on_sleep(&self) {
        let mut machine = self.inner.machine.lock().await;
        let Some(token) = machine.subscription.take() else {
            debug!("feed link is not resumed; nothing to suspend");
            return;
        };

        self.inner.advance_generation(&mut machine);
        machine.cancel_retry_task();
        if let Some(transport) = self.inner.current_transport() {
            self.inner.subscriptions.detach(transport.as_ref(), token);
            transport.close(CLOSE_NORMAL).await;
        }
        self.inner.set_state(ConnectionState::Idle);
        info!("feed link suspended");
    }

    pub async fn close(&self) {
        let mut machine = self.inner.machine.lock().await;
        self.inner.set_state(ConnectionState::Closing);

        let transport = self.inner.release_transport(&mut machine);
        if let Some(transport) = transport {
            if transport.is_connected() {
                self.inner.notifier.notify(NOTICE_CLOSING);
            }
            transport.close(CLOSE_NORMAL).await;
        }

        machine.endpoint = None;
        self.inner
            .first_message_received
            .store(false, Ordering::Release);
        self.inner.set_state(ConnectionState::Idle);
        info!("feed link closed");
    }

    pub async fn send(&self, text: impl Into<String>) -> Result<(), AppError> {
        let transport = self
            .inner
            .current_transport()
            .ok_or(AppError::NotInitialized)?;
        transport.send(text.into()).await
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.read()
    }

    pub async fn is_resumed(&self) -> bool {
        self.inner.machine.lock().await.is_resumed()
    }

    pub fn retry_attempt(&self) -> u32 {
        self.inner.retry.attempt()
    }

    pub async fn status(&self) -> LinkStatusSnapshot {
        let machine = self.inner.machine.lock().await;
        LinkStatusSnapshot {
            state: self.state(),
            resumed: machine.is_resumed(),
            retry_attempt: self.inner.retry.attempt(),
            endpoint: machine.endpoint.as_ref().map(|endpoint| endpoint.to_string()),
            first_message_received: self.inner.first_message_received.load(Ordering::Acquire),
        }
    }
}

impl LinkInner {
    fn current_transport(&self) -> Option<Arc<dyn Transport>> {
        self.transport.read().clone()
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::Acquire) == generation
    }

    fn advance_generation(&self, machine: &mut LinkState) -> u64 {
        // Bumped under the state lock so a stale task cannot slip a
        // transition in between its generation check and its write.
        let _state = self.state.write();
        machine.generation = machine.generation.wrapping_add(1);
        self.generation.store(machine.generation, Ordering::Release);
        machine.generation
    }

    fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.write();
        if *state != next {
            debug!(from = ?*state, to = ?next, "feed link state change");
            *state = next;
        }
    }

    fn transition(&self, generation: u64, next: ConnectionState) {
        let mut state = self.state.write();
        if self.generation.load(Ordering::Acquire) == generation && *state != next {
            debug!(from = ?*state, to = ?next, generation, "feed link state change");
            *state = next;
        }
    }

    fn mark_connected(&self, generation: u64) {
        if !self.is_current(generation) {
            return;
        }
        self.retry.reset();
        if *self.state.read() != ConnectionState::Connected {
            info!(generation, "feed connected");
        }
        self.transition(generation, ConnectionState::Connected);
    }

    fn fail(&self, generation: u64, reason: &str) {
        error!(error = %reason, "feed connect failed with a non-retryable error");
        self.notifier.notify(reason);
        self.transition(generation, ConnectionState::Disconnected);
    }

    /// Cancels background work, detaches handlers and hands back the
    /// transport for the caller to close.
    fn release_transport(&self, machine: &mut LinkState) -> Option<Arc<dyn Transport>> {
        self.advance_generation(machine);
        machine.cancel_retry_task();
        let transport = self.transport.write().take();
        if let (Some(token), Some(transport)) = (machine.subscription.take(), transport.as_ref()) {
            self.subscriptions.detach(transport.as_ref(), token);
        }
        transport
    }

    fn resume(self: &Arc<Self>, machine: &mut LinkState) -> Result<(), AppError> {
        if machine.is_resumed() {
            return Ok(());
        }
        let transport = self.current_transport().ok_or(AppError::NotInitialized)?;

        let generation = self.advance_generation(machine);
        let observer = Arc::new(LinkObserver {
            link: Arc::downgrade(self),
            generation,
        });
        machine.subscription = Some(self.subscriptions.attach(&transport, observer));
        self.first_message_received.store(false, Ordering::Release);
        self.set_state(ConnectionState::Connecting);

        let link = Arc::clone(self);
        self.dispatch(machine, RetryTaskKind::Connect, move |token| {
            link.run_connect_attempts(transport, generation, token)
        });
        debug!(generation, "feed link resumed");
        Ok(())
    }

    fn dispatch<F, Fut>(&self, machine: &mut LinkState, kind: RetryTaskKind, task: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        machine.cancel_retry_task();
        let cancellation_token = CancellationToken::new();
        let join_handle = tokio::spawn(task(cancellation_token.clone()));
        machine.retry_task = Some(RetryTaskHandle {
            generation: machine.generation,
            kind,
            cancellation_token,
            join_handle,
        });
    }

    async fn run_connect_attempts(
        self: Arc<Self>,
        transport: Arc<dyn Transport>,
        generation: u64,
        cancellation_token: CancellationToken,
    ) {
        while !cancellation_token.is_cancelled() {
            if transport.is_connected() {
                self.mark_connected(generation);
                return;
            }

            self.notifier.notify(NOTICE_CONNECTING);
            self.transition(generation, ConnectionState::Connecting);
            let outcome = tokio::select! {
                _ = cancellation_token.cancelled() => return,
                outcome = transport.connect() => outcome,
            };

            match outcome {
                Ok(()) => {
                    // A background handshake reports back through open or
                    // close events.
                    if transport.is_alive() {
                        self.mark_connected(generation);
                    }
                    return;
                }
                Err(error) if error.is_retryable() => {
                    let (attempt, delay) = self.retry.next_delay();
                    warn!(attempt, delay_ms = millis(delay), %error, "feed connect failed, backing off");
                    tokio::select! {
                        _ = cancellation_token.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(error) => {
                    self.fail(generation, &error.to_string());
                    return;
                }
            }
        }
    }

    fn on_transport_opened(&self, generation: u64) {
        if !self.is_current(generation) {
            return;
        }
        let state = *self.state.read();
        if matches!(
            state,
            ConnectionState::Connecting | ConnectionState::Disconnected
        ) {
            self.mark_connected(generation);
        }
    }

    fn on_first_message(&self, generation: u64) {
        if !self.is_current(generation) {
            return;
        }
        if !self.first_message_received.swap(true, Ordering::AcqRel) {
            debug!(generation, "first feed frame received");
        }
        if *self.state.read() == ConnectionState::Connecting {
            self.mark_connected(generation);
        }
    }

    fn on_transport_closed(self: &Arc<Self>, generation: u64, close: CloseInfo) {
        if !self.is_current(generation) {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let link = Arc::clone(self);
                runtime.spawn(async move { link.recover_after_close(generation, close).await });
            }
            Err(_) => warn!("feed close observed outside the tokio runtime; reconnect skipped"),
        }
    }

    async fn recover_after_close(self: Arc<Self>, generation: u64, close: CloseInfo) {
        let mut machine = self.machine.lock().await;
        if machine.generation != generation || !machine.is_resumed() {
            return;
        }
        let Some(transport) = self.current_transport() else {
            return;
        };
        if transport.is_connected() {
            return;
        }
        if machine.is_reconnecting(generation) {
            debug!(code = close.code, kind = ?close.kind, "feed reconnect already in progress");
            return;
        }

        match close.kind {
            CloseKind::Dropped => {
                warn!(
                    code = close.code,
                    reason = %close.reason,
                    clean = close.was_clean,
                    "feed connection dropped"
                );
                self.notifier.notify(NOTICE_DISCONNECTED);
                self.transition(generation, ConnectionState::Disconnected);

                let link = Arc::clone(&self);
                self.dispatch(&mut machine, RetryTaskKind::Reconnect, move |token| {
                    link.run_reconnect_loop(transport, generation, token)
                });
            }
            CloseKind::HandshakeFailed => {
                let (attempt, delay) = self.retry.next_delay();
                warn!(
                    attempt,
                    delay_ms = millis(delay),
                    error = %close.reason,
                    "feed connect failed, backing off"
                );
                self.transition(generation, ConnectionState::Connecting);

                let link = Arc::clone(&self);
                self.dispatch(&mut machine, RetryTaskKind::Connect, move |token| async move {
                    tokio::select! {
                        _ = token.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    link.run_connect_attempts(transport, generation, token).await;
                });
            }
            CloseKind::HandshakeRejected => self.fail(generation, &close.reason),
        }
    }

    async fn run_reconnect_loop(
        self: Arc<Self>,
        transport: Arc<dyn Transport>,
        generation: u64,
        cancellation_token: CancellationToken,
    ) {
        while !transport.is_alive() {
            let (attempt, delay) = self.retry.next_delay();
            debug!(attempt, delay_ms = millis(delay), "waiting before feed reconnect");
            tokio::select! {
                _ = cancellation_token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            self.notifier.notify(NOTICE_CONNECTING);
            self.transition(generation, ConnectionState::Connecting);
            let outcome = tokio::select! {
                _ = cancellation_token.cancelled() => return,
                outcome = transport.connect() => outcome,
            };

            match outcome {
                Ok(()) => {}
                Err(error) if error.is_retryable() => {
                    debug!(attempt, %error, "feed reconnect attempt failed");
                    self.transition(generation, ConnectionState::Disconnected);
                }
                Err(error) => {
                    self.fail(generation, &error.to_string());
                    return;
                }
            }
        }

        self.mark_connected(generation);
    }
}
