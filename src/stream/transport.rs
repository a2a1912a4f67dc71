use crate::error::AppError;
use crate::stream::tls::client_config;
use crate::stream::types::{
    CloseInfo, ConnectMode, FeedMessage, LinkConfig, ReadyState, CLOSE_NO_STATUS,
    MAX_FRAME_SIZE, MAX_MESSAGE_SIZE,
};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

pub type FeedWsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerControl {
    Keep,
    Remove,
}

pub type MessageHandler = Arc<dyn Fn(&FeedMessage) -> HandlerControl + Send + Sync>;
pub type ErrorHandler = Arc<dyn Fn(&str) + Send + Sync>;
pub type StatusHandler = Arc<dyn Fn(&SocketEvent) + Send + Sync>;

/// Connection status changes published by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    Opened,
    Closed(CloseInfo),
}

#[derive(Clone)]
pub enum EventHandler {
    Message(MessageHandler),
    Error(ErrorHandler),
    Status(StatusHandler),
}

/// Multi-subscriber event source owned by a transport.
///
/// Handlers run in registration order on the task that emits the event. A
/// handler may be removed while an event is being dispatched; it is skipped
/// from that point on.
#[derive(Default)]
pub struct EventHub {
    next_id: AtomicU64,
    handlers: Mutex<Vec<(HandlerId, EventHandler)>>,
}

impl fmt::Debug for EventHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHub")
            .field("handlers", &self.len())
            .finish()
    }
}

impl EventHub {
    pub fn subscribe(&self, handler: EventHandler) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers.lock().push((id, handler));
        id
    }

    /// Returns `false` when the handler was not registered.
    pub fn unsubscribe(&self, id: HandlerId) -> bool {
        let mut handlers = self.handlers.lock();
        let before = handlers.len();
        handlers.retain(|(registered, _)| *registered != id);
        handlers.len() != before
    }

    pub fn contains(&self, id: HandlerId) -> bool {
        self.handlers
            .lock()
            .iter()
            .any(|(registered, _)| *registered == id)
    }

    pub fn len(&self) -> usize {
        self.handlers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn emit_message(&self, message: &FeedMessage) {
        let listeners: Vec<(HandlerId, MessageHandler)> = self
            .handlers
            .lock()
            .iter()
            .filter_map(|(id, handler)| match handler {
                EventHandler::Message(callback) => Some((*id, Arc::clone(callback))),
                _ => None,
            })
            .collect();

        for (id, callback) in listeners {
            if !self.contains(id) {
                continue;
            }
            if callback(message) == HandlerControl::Remove {
                self.unsubscribe(id);
            }
        }
    }

    pub fn emit_error(&self, text: &str) {
        let listeners: Vec<(HandlerId, ErrorHandler)> = self
            .handlers
            .lock()
            .iter()
            .filter_map(|(id, handler)| match handler {
                EventHandler::Error(callback) => Some((*id, Arc::clone(callback))),
                _ => None,
            })
            .collect();

        for (id, callback) in listeners {
            if self.contains(id) {
                callback(text);
            }
        }
    }

    pub fn emit_open(&self) {
        self.emit_status(&SocketEvent::Opened);
    }

    pub fn emit_close(&self, close: &CloseInfo) {
        self.emit_status(&SocketEvent::Closed(close.clone()));
    }

    fn emit_status(&self, event: &SocketEvent) {
        let listeners: Vec<(HandlerId, StatusHandler)> = self
            .handlers
            .lock()
            .iter()
            .filter_map(|(id, handler)| match handler {
                EventHandler::Status(callback) => Some((*id, Arc::clone(callback))),
                _ => None,
            })
            .collect();

        for (id, callback) in listeners {
            if self.contains(id) {
                callback(event);
            }
        }
    }
}

/// A single persistent bidirectional connection to the feed.
///
/// `connect` hides whether the handshake ran inline or in the background:
/// callers only learn about background failures through the error and close
/// events published on [`Transport::events`].
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self) -> Result<(), AppError>;

    async fn send(&self, text: String) -> Result<(), AppError>;

    /// Requests a graceful close. Never fails; closing a socket that is not
    /// open does nothing.
    async fn close(&self, code: u16);

    fn is_alive(&self) -> bool;

    fn ready_state(&self) -> ReadyState;

    fn events(&self) -> &EventHub;

    fn is_connected(&self) -> bool {
        self.ready_state() == ReadyState::Open
    }
}

pub trait TransportFactory: Send + Sync {
    fn create(&self, endpoint: &Url, config: &LinkConfig) -> Result<Arc<dyn Transport>, AppError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketTransportFactory;

impl TransportFactory for WebSocketTransportFactory {
    fn create(&self, endpoint: &Url, config: &LinkConfig) -> Result<Arc<dyn Transport>, AppError> {
        Ok(Arc::new(WebSocketTransport::new(endpoint.clone(), config)?))
    }
}

struct ReaderHandle {
    cancellation_token: CancellationToken,
    join_handle: JoinHandle<()>,
}

struct SocketShared {
    endpoint: Url,
    connector: Option<Connector>,
    mode: ConnectMode,
    emit_on_ping: bool,
    hub: EventHub,
    ready_state: RwLock<ReadyState>,
    session: AtomicU64,
    /// Id of the handshake allowed to settle; bumped by every connect and by
    /// close while connecting.
    handshake: AtomicU64,
    writer: tokio::sync::Mutex<Option<SplitSink<FeedWsStream, Message>>>,
    reader: Mutex<Option<ReaderHandle>>,
}

/// tokio-tungstenite backed [`Transport`].
#[derive(Clone)]
pub struct WebSocketTransport {
    shared: Arc<SocketShared>,
}

impl fmt::Debug for WebSocketTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketTransport")
            .field("endpoint", &self.shared.endpoint.as_str())
            .field("mode", &self.shared.mode)
            .field("ready_state", &*self.shared.ready_state.read())
            .finish()
    }
}

fn ws_config() -> WebSocketConfig {
    WebSocketConfig {
        max_message_size: Some(MAX_MESSAGE_SIZE),
        max_frame_size: Some(MAX_FRAME_SIZE),
        ..Default::default()
    }
}

fn close_info_from_frame(frame: Option<CloseFrame<'_>>) -> CloseInfo {
    match frame {
        Some(frame) => CloseInfo::clean(u16::from(frame.code), frame.reason.into_owned()),
        None => CloseInfo::clean(CLOSE_NO_STATUS, String::new()),
    }
}

impl WebSocketTransport {
    pub fn new(endpoint: Url, config: &LinkConfig) -> Result<Self, AppError> {
        let connector = match endpoint.scheme() {
            "wss" => Some(Connector::Rustls(client_config(config.tls_policy)?)),
            "ws" => None,
            other => {
                return Err(AppError::InvalidArgument(format!(
                    "feed endpoint must use ws or wss, got {other}"
                )))
            }
        };

        Ok(Self {
            shared: Arc::new(SocketShared {
                endpoint,
                connector,
                mode: config.connect_mode,
                emit_on_ping: config.emit_on_ping,
                hub: EventHub::default(),
                ready_state: RwLock::new(ReadyState::New),
                session: AtomicU64::new(0),
                handshake: AtomicU64::new(0),
                writer: tokio::sync::Mutex::new(None),
                reader: Mutex::new(None),
            }),
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.shared.endpoint
    }
}

/// Resets a handshake that was abandoned before it settled.
struct HandshakeGuard<'a> {
    shared: &'a SocketShared,
    handshake: u64,
    armed: bool,
}

impl Drop for HandshakeGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut ready_state = self.shared.ready_state.write();
        if self.shared.is_current_handshake(self.handshake)
            && *ready_state == ReadyState::Connecting
        {
            *ready_state = ReadyState::Closed;
        }
    }
}

impl SocketShared {
    fn is_current_handshake(&self, handshake: u64) -> bool {
        self.handshake.load(Ordering::Acquire) == handshake
    }

    async fn open(self: &Arc<Self>, handshake: u64) -> Result<(), AppError> {
        let mut guard = HandshakeGuard {
            shared: self,
            handshake,
            armed: true,
        };

        debug!(endpoint = %self.endpoint, handshake, "opening feed websocket");
        let (stream, _) = connect_async_tls_with_config(
            self.endpoint.as_str(),
            Some(ws_config()),
            false,
            self.connector.clone(),
        )
        .await?;
        let (writer, reader) = stream.split();

        let mut writer_slot = self.writer.lock().await;
        {
            let mut ready_state = self.ready_state.write();
            if !self.is_current_handshake(handshake) || *ready_state != ReadyState::Connecting {
                // Superseded by close() or a newer connect(); the socket is dropped.
                return Err(AppError::Closed);
            }
            *ready_state = ReadyState::Open;
        }
        *writer_slot = Some(writer);
        drop(writer_slot);
        guard.armed = false;

        let session = self.session.fetch_add(1, Ordering::AcqRel) + 1;
        let cancellation_token = CancellationToken::new();
        let join_handle = tokio::spawn(read_frames(
            Arc::clone(self),
            reader,
            session,
            cancellation_token.clone(),
        ));
        let previous = self.reader.lock().replace(ReaderHandle {
            cancellation_token,
            join_handle,
        });
        if let Some(previous) = previous {
            previous.cancellation_token.cancel();
            drop(previous.join_handle);
        }

        info!(endpoint = %self.endpoint, "feed websocket open");
        self.hub.emit_open();
        Ok(())
    }
}

async fn read_frames(
    shared: Arc<SocketShared>,
    mut reader: SplitStream<FeedWsStream>,
    session: u64,
    cancellation_token: CancellationToken,
) {
    let close = loop {
        let frame = tokio::select! {
            _ = cancellation_token.cancelled() => return,
            next_frame = reader.next() => next_frame,
        };

        match frame {
            Some(Ok(Message::Text(text))) => shared.hub.emit_message(&FeedMessage::Text(text)),
            Some(Ok(Message::Binary(payload))) => {
                shared.hub.emit_message(&FeedMessage::Binary(payload))
            }
            Some(Ok(Message::Ping(payload))) => {
                if shared.emit_on_ping {
                    shared.hub.emit_message(&FeedMessage::Ping(payload));
                }
            }
            Some(Ok(Message::Close(frame))) => break close_info_from_frame(frame),
            Some(Ok(_)) => {}
            Some(Err(error)) => {
                let text = error.to_string();
                shared.hub.emit_error(&text);
                break CloseInfo::abnormal(text);
            }
            None => break CloseInfo::abnormal("feed stream ended"),
        }
    };

    if shared.session.load(Ordering::Acquire) != session {
        return;
    }
    *shared.ready_state.write() = ReadyState::Closed;
    shared.writer.lock().await.take();
    debug!(code = close.code, reason = %close.reason, "feed websocket closed");
    shared.hub.emit_close(&close);
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self) -> Result<(), AppError> {
        let handshake = {
            let mut ready_state = self.shared.ready_state.write();
            if matches!(*ready_state, ReadyState::Connecting | ReadyState::Open) {
                return Ok(());
            }
            *ready_state = ReadyState::Connecting;
            self.shared.handshake.fetch_add(1, Ordering::AcqRel) + 1
        };

        match self.shared.mode {
            ConnectMode::Blocking => self.shared.open(handshake).await,
            ConnectMode::Background => {
                let shared = Arc::clone(&self.shared);
                tokio::spawn(async move {
                    let Err(error) = shared.open(handshake).await else {
                        return;
                    };
                    if !shared.is_current_handshake(handshake) {
                        debug!(handshake, %error, "superseded feed handshake dropped");
                        return;
                    }
                    warn!(endpoint = %shared.endpoint, %error, "feed websocket handshake failed");
                    shared.hub.emit_error(&error.to_string());
                    shared.hub.emit_close(&CloseInfo::handshake_failed(&error));
                });
                Ok(())
            }
        }
    }

    async fn send(&self, text: String) -> Result<(), AppError> {
        let mut writer_slot = self.shared.writer.lock().await;
        let writer = writer_slot.as_mut().ok_or(AppError::Closed)?;
        writer.send(Message::Text(text)).await?;
        Ok(())
    }

    async fn close(&self, code: u16) {
        {
            let mut ready_state = self.shared.ready_state.write();
            match *ready_state {
                ReadyState::Open => *ready_state = ReadyState::Closing,
                ReadyState::Connecting => {
                    self.shared.handshake.fetch_add(1, Ordering::AcqRel);
                    *ready_state = ReadyState::Closed;
                    return;
                }
                ReadyState::New | ReadyState::Closing | ReadyState::Closed => return,
            }
        }

        let mut writer_slot = self.shared.writer.lock().await;
        let Some(writer) = writer_slot.as_mut() else {
            *self.shared.ready_state.write() = ReadyState::Closed;
            return;
        };

        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: "".into(),
        };
        if let Err(error) = writer.send(Message::Close(Some(frame))).await {
            debug!(%error, "feed websocket close frame could not be sent");
            writer_slot.take();
            *self.shared.ready_state.write() = ReadyState::Closed;
            if let Some(reader) = self.shared.reader.lock().take() {
                reader.cancellation_token.cancel();
            }
        }
    }

    fn is_alive(&self) -> bool {
        *self.shared.ready_state.read() == ReadyState::Open
    }

    fn ready_state(&self) -> ReadyState {
        *self.shared.ready_state.read()
    }

    fn events(&self) -> &EventHub {
        &self.shared.hub
    }
}
