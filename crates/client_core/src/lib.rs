use std::{
    collections::HashMap,
    sync::{Arc, Weak},
    time::Duration,
};

use futures::{Sink, SinkExt, StreamExt};
use shared::{
    domain::{ChannelState, ChannelStatus, NoticeLevel},
    error::ChannelError,
    protocol::{Command, InboundFrame},
};
use tokio::{
    sync::{broadcast, mpsc, oneshot, Mutex, RwLock},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, trace, warn};

pub mod config;
pub mod fallback;
pub mod retry;
pub mod status;

pub use retry::RetryPolicy;

pub const SHUTDOWN_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Anything the channel can write command frames to.
///
/// The channel implements this for its own socket; a host that already owns
/// a connection to the backend can hand one in with
/// [`CommandChannel::new_with_shared_link`].
pub trait FrameSink: Send + Sync {
    fn is_open(&self) -> bool;
    fn send_frame(&self, frame: String) -> Result<(), ChannelError>;
}

pub type StatusHandler = Arc<dyn Fn(&InboundFrame) + Send + Sync>;

#[derive(Debug, Clone)]
pub enum ChannelEvent {
    StatusChanged(ChannelStatus),
    Frame(InboundFrame),
    Notice { level: NoticeLevel, message: String },
}

#[derive(Debug, Clone)]
pub struct ChannelOptions {
    pub url: String,
    pub credential: String,
    pub reconnect: RetryPolicy,
}

struct Connection {
    id: u64,
    outbound: mpsc::UnboundedSender<Message>,
}

impl FrameSink for Connection {
    fn is_open(&self) -> bool {
        !self.outbound.is_closed()
    }

    fn send_frame(&self, frame: String) -> Result<(), ChannelError> {
        self.outbound.send(Message::Text(frame)).map_err(|_| {
            ChannelError::Transport(format!("connection {} writer stopped", self.id))
        })
    }
}

struct ChannelInner {
    status: ChannelStatus,
    connection: Option<Arc<Connection>>,
    current_id: u64,
    connect_attempts: u64,
    reconnect_attempt: u32,
    reconnect_task: Option<JoinHandle<()>>,
    writer_task: Option<JoinHandle<()>>,
    shut_down: bool,
}

/// Single command connection to the robot backend.
///
/// Holds at most one socket. A close or transport error schedules exactly one
/// reconnect after the policy delay; sends never queue or replay.
pub struct CommandChannel {
    options: ChannelOptions,
    shared_link: Option<Arc<dyn FrameSink>>,
    inner: Mutex<ChannelInner>,
    handlers: RwLock<HashMap<String, Vec<StatusHandler>>>,
    events: broadcast::Sender<ChannelEvent>,
}

impl CommandChannel {
    pub fn new(options: ChannelOptions) -> Arc<Self> {
        Self::build(options, None)
    }

    pub fn new_with_shared_link(options: ChannelOptions, link: Arc<dyn FrameSink>) -> Arc<Self> {
        Self::build(options, Some(link))
    }

    fn build(options: ChannelOptions, shared_link: Option<Arc<dyn FrameSink>>) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            options,
            shared_link,
            inner: Mutex::new(ChannelInner {
                status: ChannelStatus::Disconnected,
                connection: None,
                current_id: 0,
                connect_attempts: 0,
                reconnect_attempt: 0,
                reconnect_task: None,
                writer_task: None,
                shut_down: false,
            }),
            handlers: RwLock::new(HashMap::new()),
            events,
        })
    }

    pub fn options(&self) -> &ChannelOptions {
        &self.options
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    pub async fn status(&self) -> ChannelStatus {
        self.inner.lock().await.status
    }

    pub async fn state(&self) -> ChannelState {
        let inner = self.inner.lock().await;
        let delay = self.options.reconnect.delay_for(inner.reconnect_attempt);
        ChannelState {
            status: inner.status,
            retry_delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            reconnect_pending: inner.reconnect_task.is_some(),
            connect_attempts: inner.connect_attempts,
        }
    }

    /// Registers `handler` for inbound frames whose discriminator equals `title`.
    pub async fn register_handler(
        &self,
        title: impl Into<String>,
        handler: impl Fn(&InboundFrame) + Send + Sync + 'static,
    ) {
        self.handlers
            .write()
            .await
            .entry(title.into())
            .or_default()
            .push(Arc::new(handler));
    }

    /// Opens the channel's own connection unless one is already open.
    pub async fn connect(self: &Arc<Self>) -> Result<(), ChannelError> {
        self.open_connection().await.map(|_| ())
    }

    /// Shared link if open, then our own open socket, then a fresh connection.
    pub async fn acquire_connection(self: &Arc<Self>) -> Option<Arc<dyn FrameSink>> {
        if let Some(link) = &self.shared_link {
            if link.is_open() {
                return Some(Arc::clone(link));
            }
        }

        {
            let inner = self.inner.lock().await;
            if inner.shut_down {
                return None;
            }
            match inner.status {
                ChannelStatus::Open => {
                    if let Some(connection) = inner.connection.as_ref().filter(|c| c.is_open()) {
                        let link: Arc<dyn FrameSink> = connection.clone();
                        return Some(link);
                    }
                }
                ChannelStatus::Connecting => {
                    debug!("channel: connection attempt already in flight");
                    return None;
                }
                ChannelStatus::Disconnected | ChannelStatus::Closed => {}
            }
        }

        match self.open_connection().await {
            Ok(connection) => {
                let link: Arc<dyn FrameSink> = connection;
                Some(link)
            }
            Err(err) => {
                debug!("channel: acquire failed: {err}");
                None
            }
        }
    }

    /// Best-effort, at-most-once delivery of `command`.
    pub async fn send(self: &Arc<Self>, command: impl Into<Command>) -> Result<(), ChannelError> {
        let command = command.into();
        let frame = command.to_frame()?;
        if self.inner.lock().await.shut_down {
            return Err(ChannelError::Shutdown);
        }

        let Some(link) = self.acquire_connection().await else {
            warn!(command = command.name(), "channel: not ready, command not sent");
            self.notify(
                NoticeLevel::Warning,
                format!("command not sent: {}", command.name()),
            );
            return Err(ChannelError::ConnectionUnavailable);
        };

        link.send_frame(frame)?;
        debug!(command = command.name(), "channel: sent command");
        Ok(())
    }

    /// Parses a raw inbound frame; non-JSON text is dropped.
    pub async fn on_message(&self, raw: &str) {
        let Some(frame) = InboundFrame::parse(raw) else {
            trace!(len = raw.len(), "channel: ignoring non-JSON frame");
            return;
        };
        self.dispatch(frame).await;
    }

    /// Runs the handlers registered for `frame` and broadcasts it.
    pub async fn dispatch(&self, frame: InboundFrame) {
        if let Some(key) = frame.discriminator() {
            let handlers = self
                .handlers
                .read()
                .await
                .get(key)
                .cloned()
                .unwrap_or_default();
            for handler in handlers {
                handler(&frame);
            }
        }
        let _ = self.events.send(ChannelEvent::Frame(frame));
    }

    pub fn notify(&self, level: NoticeLevel, message: impl Into<String>) {
        let _ = self.events.send(ChannelEvent::Notice {
            level,
            message: message.into(),
        });
    }

    /// Closes the socket, cancels any pending reconnect and refuses further sends.
    ///
    /// Frames already queued are flushed before the close frame, waiting at
    /// most [`SHUTDOWN_FLUSH_TIMEOUT`].
    pub async fn shutdown(&self) {
        let (connection, writer_task) = {
            let mut inner = self.inner.lock().await;
            inner.shut_down = true;
            if let Some(task) = inner.reconnect_task.take() {
                task.abort();
            }
            inner.status = ChannelStatus::Disconnected;
            (inner.connection.take(), inner.writer_task.take())
        };
        if let Some(connection) = connection {
            let _ = connection.outbound.send(Message::Close(None));
        }
        if let Some(writer_task) = writer_task {
            if tokio::time::timeout(SHUTDOWN_FLUSH_TIMEOUT, writer_task)
                .await
                .is_err()
            {
                debug!("channel: writer did not flush before shutdown timeout");
            }
        }
        info!(url = %self.options.url, "channel: shut down");
        self.emit_status(ChannelStatus::Disconnected);
    }

    async fn open_connection(self: &Arc<Self>) -> Result<Arc<Connection>, ChannelError> {
        let id = {
            let mut inner = self.inner.lock().await;
            if inner.shut_down {
                return Err(ChannelError::Shutdown);
            }
            match inner.status {
                ChannelStatus::Open => {
                    if let Some(connection) = inner.connection.as_ref().filter(|c| c.is_open()) {
                        return Ok(Arc::clone(connection));
                    }
                }
                ChannelStatus::Connecting => return Err(ChannelError::ConnectionUnavailable),
                ChannelStatus::Disconnected | ChannelStatus::Closed => {}
            }
            if let Some(task) = inner.reconnect_task.take() {
                task.abort();
            }
            inner.current_id += 1;
            inner.connect_attempts += 1;
            inner.status = ChannelStatus::Connecting;
            inner.connection = None;
            inner.current_id
        };
        self.emit_status(ChannelStatus::Connecting);
        info!(url = %self.options.url, connection_id = id, "channel: connecting");

        let ws_stream = match connect_async(self.options.url.as_str()).await {
            Ok((stream, _)) => stream,
            Err(err) => {
                let reason = err.to_string();
                self.handle_closed(id, &reason).await;
                return Err(ChannelError::Transport(reason));
            }
        };
        let (writer, mut reader) = ws_stream.split();
        let (outbound, outbound_rx) = mpsc::unbounded_channel::<Message>();
        let connection = Arc::new(Connection { id, outbound });
        // Credential goes first so it precedes every caller frame.
        connection.send_frame(self.options.credential.clone())?;

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let writer_task = self.spawn_writer(id, writer, outbound_rx, stop_rx);

        {
            let mut inner = self.inner.lock().await;
            if inner.shut_down || inner.current_id != id {
                writer_task.abort();
                return Err(if inner.shut_down {
                    ChannelError::Shutdown
                } else {
                    ChannelError::ConnectionUnavailable
                });
            }
            if inner.status != ChannelStatus::Connecting {
                // The writer already failed and reported the close.
                return Err(ChannelError::Transport(format!(
                    "connection {id} closed during handshake"
                )));
            }
            inner.status = ChannelStatus::Open;
            inner.connection = Some(Arc::clone(&connection));
            inner.writer_task = Some(writer_task);
            inner.reconnect_attempt = 0;
        }

        let channel = Arc::downgrade(self);
        tokio::spawn(async move {
            let reason = loop {
                match reader.next().await {
                    Some(Ok(Message::Text(text))) => {
                        let Some(channel) = channel.upgrade() else {
                            return;
                        };
                        channel.on_message(&text).await;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break frame
                            .map(|f| format!("closed by peer: {}", f.reason))
                            .unwrap_or_else(|| "closed by peer".to_string());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => break format!("receive failed: {err}"),
                    None => break "stream ended".to_string(),
                }
            };
            drop(stop_tx);
            if let Some(channel) = channel.upgrade() {
                channel.handle_closed(id, &reason).await;
            }
        });

        info!(url = %self.options.url, connection_id = id, "channel: connected");
        self.emit_status(ChannelStatus::Open);
        self.notify(NoticeLevel::Success, "command channel connected");
        Ok(connection)
    }

    /// Drains the connection's queue into `sink`; a failed write closes the connection.
    fn spawn_writer<S>(
        self: &Arc<Self>,
        id: u64,
        mut sink: S,
        mut outbound_rx: mpsc::UnboundedReceiver<Message>,
        mut stop_rx: oneshot::Receiver<()>,
    ) -> JoinHandle<()>
    where
        S: Sink<Message> + Send + Unpin + 'static,
        S::Error: std::fmt::Display,
    {
        let channel = Arc::downgrade(self);
        tokio::spawn(async move {
            let failure = loop {
                tokio::select! {
                    message = outbound_rx.recv() => {
                        let Some(message) = message else { break None };
                        let closing = matches!(message, Message::Close(_));
                        if let Err(err) = sink.send(message).await {
                            break Some(format!("write failed: {err}"));
                        }
                        if closing {
                            break None;
                        }
                    }
                    _ = &mut stop_rx => break None,
                }
            };
            if let Some(reason) = failure {
                debug!(connection_id = id, "channel: {reason}");
                if let Some(channel) = channel.upgrade() {
                    channel.handle_closed(id, &reason).await;
                }
            }
        })
    }

    async fn handle_closed(self: &Arc<Self>, id: u64, reason: &str) {
        {
            let mut inner = self.inner.lock().await;
            if inner.shut_down || inner.current_id != id || inner.status == ChannelStatus::Closed {
                return;
            }
            inner.status = ChannelStatus::Closed;
            inner.connection = None;
            inner.writer_task = None;
            self.schedule_reconnect(&mut inner);
        }
        warn!(connection_id = id, reason, "channel: connection closed");
        self.emit_status(ChannelStatus::Closed);
        self.notify(NoticeLevel::Error, "command channel disconnected");
    }

    fn schedule_reconnect(self: &Arc<Self>, inner: &mut ChannelInner) {
        if inner.shut_down || inner.status.is_live() || inner.reconnect_task.is_some() {
            return;
        }
        let policy = self.options.reconnect;
        if !policy.allows(inner.reconnect_attempt) {
            warn!(
                attempts = inner.reconnect_attempt,
                "channel: reconnect attempts exhausted"
            );
            return;
        }
        let delay = policy.delay_for(inner.reconnect_attempt);
        inner.reconnect_attempt = inner.reconnect_attempt.saturating_add(1);
        debug!(?delay, "channel: reconnect scheduled");

        let channel = Arc::downgrade(self);
        inner.reconnect_task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(channel) = Weak::upgrade(&channel) else {
                return;
            };
            {
                let mut inner = channel.inner.lock().await;
                inner.reconnect_task = None;
                if inner.shut_down || inner.status.is_live() {
                    return;
                }
            }
            if let Err(err) = channel.open_connection().await {
                debug!("channel: reconnect attempt failed: {err}");
            }
        }));
    }

    fn emit_status(&self, status: ChannelStatus) {
        let _ = self.events.send(ChannelEvent::StatusChanged(status));
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;

#[cfg(test)]
#[path = "tests/channel_tests.rs"]
mod tests;
