//! In-memory collaborators for lifecycle tests.

use crate::error::AppError;
use crate::stream::feed::{EndpointResolver, FeedConsumer, Notifier};
use crate::stream::transport::{EventHub, Transport, TransportFactory};
use crate::stream::types::{CloseInfo, ConnectMode, FeedMessage, LinkConfig, ReadyState};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::Instant;
use url::Url;

/// Time a background handshake takes to settle.
pub(crate) const HANDSHAKE_LATENCY: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectOutcome {
    Succeed,
    /// Network-level refusal, retried by the lifecycle loops.
    Refuse,
    /// A failure the lifecycle must not retry.
    Reject,
}

impl ConnectOutcome {
    fn error(self) -> Option<AppError> {
        match self {
            Self::Succeed => None,
            Self::Refuse => Some(AppError::Network("connection refused".to_string())),
            Self::Reject => Some(AppError::InvalidArgument("handshake rejected".to_string())),
        }
    }
}

/// Transport whose `connect` results follow a script; once the script runs
/// out every connect succeeds.
///
/// In background mode `connect` only starts the handshake; the outcome
/// arrives [`HANDSHAKE_LATENCY`] later as open or error+close events.
pub(crate) struct ScriptedTransport {
    me: Weak<ScriptedTransport>,
    mode: ConnectMode,
    handshake: Mutex<u64>,
    hub: EventHub,
    ready_state: Mutex<ReadyState>,
    script: Mutex<VecDeque<ConnectOutcome>>,
    connect_calls: Mutex<Vec<Instant>>,
    close_codes: Mutex<Vec<u16>>,
    sent: Mutex<Vec<String>>,
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        Self {
            me: Weak::new(),
            mode: ConnectMode::Blocking,
            handshake: Mutex::new(0),
            hub: EventHub::default(),
            ready_state: Mutex::new(ReadyState::New),
            script: Mutex::new(VecDeque::new()),
            connect_calls: Mutex::new(Vec::new()),
            close_codes: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
        }
    }
}

impl ScriptedTransport {
    pub(crate) fn scripted(outcomes: &[ConnectOutcome]) -> Self {
        let transport = Self::default();
        transport.push_script(outcomes);
        transport
    }

    pub(crate) fn background(outcomes: &[ConnectOutcome]) -> Arc<Self> {
        let transport = Arc::new_cyclic(|me| Self {
            me: me.clone(),
            mode: ConnectMode::Background,
            ..Self::default()
        });
        transport.push_script(outcomes);
        transport
    }

    pub(crate) fn push_script(&self, outcomes: &[ConnectOutcome]) {
        self.script.lock().extend(outcomes.iter().copied());
    }

    pub(crate) fn deliver(&self, text: &str) {
        self.hub.emit_message(&FeedMessage::Text(text.to_string()));
    }

    /// Simulates the server dropping an established connection.
    pub(crate) fn drop_connection(&self, reason: &str) {
        *self.ready_state.lock() = ReadyState::Closed;
        self.hub.emit_close(&CloseInfo::abnormal(reason));
    }

    pub(crate) fn force_open(&self) {
        *self.ready_state.lock() = ReadyState::Open;
    }

    pub(crate) fn force_closed(&self) {
        *self.ready_state.lock() = ReadyState::Closed;
    }

    pub(crate) fn handler_count(&self) -> usize {
        self.hub.len()
    }

    pub(crate) fn connect_calls(&self) -> Vec<Instant> {
        self.connect_calls.lock().clone()
    }

    pub(crate) fn close_codes(&self) -> Vec<u16> {
        self.close_codes.lock().clone()
    }

    pub(crate) fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }

    fn next_outcome(&self) -> ConnectOutcome {
        self.script
            .lock()
            .pop_front()
            .unwrap_or(ConnectOutcome::Succeed)
    }

    fn settle(&self, handshake: u64, outcome: ConnectOutcome) {
        {
            let mut ready_state = self.ready_state.lock();
            if *self.handshake.lock() != handshake || *ready_state != ReadyState::Connecting {
                return;
            }
            *ready_state = match outcome {
                ConnectOutcome::Succeed => ReadyState::Open,
                ConnectOutcome::Refuse | ConnectOutcome::Reject => ReadyState::Closed,
            };
        }
        match outcome.error() {
            None => self.hub.emit_open(),
            Some(error) => {
                self.hub.emit_error(&error.to_string());
                self.hub.emit_close(&CloseInfo::handshake_failed(&error));
            }
        }
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn connect(&self) -> Result<(), AppError> {
        match self.mode {
            ConnectMode::Blocking => {
                self.connect_calls.lock().push(Instant::now());
                match self.next_outcome().error() {
                    None => {
                        *self.ready_state.lock() = ReadyState::Open;
                        self.hub.emit_open();
                        Ok(())
                    }
                    Some(error) => {
                        *self.ready_state.lock() = ReadyState::Closed;
                        Err(error)
                    }
                }
            }
            ConnectMode::Background => {
                {
                    let mut ready_state = self.ready_state.lock();
                    if matches!(*ready_state, ReadyState::Connecting | ReadyState::Open) {
                        return Ok(());
                    }
                    *ready_state = ReadyState::Connecting;
                }
                self.connect_calls.lock().push(Instant::now());
                let handshake = {
                    let mut current = self.handshake.lock();
                    *current += 1;
                    *current
                };
                let outcome = self.next_outcome();
                let me = self.me.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(HANDSHAKE_LATENCY).await;
                    if let Some(transport) = me.upgrade() {
                        transport.settle(handshake, outcome);
                    }
                });
                Ok(())
            }
        }
    }

    async fn send(&self, text: String) -> Result<(), AppError> {
        if !self.is_alive() {
            return Err(AppError::Closed);
        }
        self.sent.lock().push(text);
        Ok(())
    }

    async fn close(&self, code: u16) {
        let mut ready_state = self.ready_state.lock();
        match *ready_state {
            ReadyState::Open => self.close_codes.lock().push(code),
            ReadyState::Connecting => *self.handshake.lock() += 1,
            _ => {}
        }
        *ready_state = ReadyState::Closed;
    }

    fn is_alive(&self) -> bool {
        *self.ready_state.lock() == ReadyState::Open
    }

    fn ready_state(&self) -> ReadyState {
        *self.ready_state.lock()
    }

    fn events(&self) -> &EventHub {
        &self.hub
    }
}

/// Hands out queued transports, then fresh default ones.
#[derive(Default)]
pub(crate) struct ScriptedFactory {
    queued: Mutex<VecDeque<Arc<ScriptedTransport>>>,
    created: Mutex<Vec<Arc<ScriptedTransport>>>,
}

impl ScriptedFactory {
    pub(crate) fn with(transports: Vec<Arc<ScriptedTransport>>) -> Self {
        Self {
            queued: Mutex::new(transports.into()),
            created: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn created(&self) -> Vec<Arc<ScriptedTransport>> {
        self.created.lock().clone()
    }
}

impl TransportFactory for ScriptedFactory {
    fn create(&self, _endpoint: &Url, _config: &LinkConfig) -> Result<Arc<dyn Transport>, AppError> {
        let transport = self
            .queued
            .lock()
            .pop_front()
            .unwrap_or_else(|| Arc::new(ScriptedTransport::default()));
        self.created.lock().push(Arc::clone(&transport));
        Ok(transport)
    }
}

pub(crate) struct FixedEndpoint;

#[async_trait]
impl EndpointResolver for FixedEndpoint {
    async fn feed_endpoint(&self) -> Result<Url, AppError> {
        Ok(Url::parse("wss://feed.test/realtime")?)
    }
}

pub(crate) struct UnreachableEndpoint;

#[async_trait]
impl EndpointResolver for UnreachableEndpoint {
    async fn feed_endpoint(&self) -> Result<Url, AppError> {
        Err(AppError::InvalidArgument("no markets configured".to_string()))
    }
}

#[derive(Default)]
pub(crate) struct RecordingNotifier {
    messages: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    pub(crate) fn messages(&self) -> Vec<String> {
        self.messages.lock().clone()
    }

    pub(crate) fn count(&self, text: &str) -> usize {
        self.messages
            .lock()
            .iter()
            .filter(|message| message.as_str() == text)
            .count()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, text: &str) {
        self.messages.lock().push(text.to_string());
    }
}

#[derive(Default)]
pub(crate) struct RecordingConsumer {
    frames: Mutex<Vec<FeedMessage>>,
}

impl RecordingConsumer {
    pub(crate) fn frames(&self) -> Vec<FeedMessage> {
        self.frames.lock().clone()
    }
}

impl FeedConsumer for RecordingConsumer {
    fn on_message(&self, message: &FeedMessage) {
        self.frames.lock().push(message.clone());
    }
}
