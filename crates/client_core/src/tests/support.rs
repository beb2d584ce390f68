use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use shared::domain::ChannelStatus;
use tokio::{
    net::TcpListener,
    sync::{broadcast, mpsc},
    time::timeout,
};

use crate::{ChannelOptions, CommandChannel, RetryPolicy};

pub const WAIT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone)]
pub enum BackendControl {
    Push(String),
    Close,
}

#[derive(Clone)]
struct BackendState {
    frames: mpsc::UnboundedSender<String>,
    control: broadcast::Sender<BackendControl>,
    connections: Arc<AtomicUsize>,
}

/// In-process stand-in for the robot's WebSocket server.
pub struct TestBackend {
    pub url: String,
    frames: mpsc::UnboundedReceiver<String>,
    control: broadcast::Sender<BackendControl>,
    connections: Arc<AtomicUsize>,
}

impl TestBackend {
    pub async fn spawn() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let (frames_tx, frames) = mpsc::unbounded_channel();
        let (control, _) = broadcast::channel(64);
        let connections = Arc::new(AtomicUsize::new(0));
        let state = BackendState {
            frames: frames_tx,
            control: control.clone(),
            connections: Arc::clone(&connections),
        };
        let app = Router::new().route("/", get(ws_handler)).with_state(state);
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Self {
            url: format!("ws://{addr}"),
            frames,
            control,
            connections,
        }
    }

    pub async fn next_frame(&mut self) -> String {
        timeout(WAIT, self.frames.recv())
            .await
            .expect("frame arrives in time")
            .expect("backend alive")
    }

    pub async fn assert_no_frame(&mut self, wait: Duration) {
        if let Ok(frame) = timeout(wait, self.frames.recv()).await {
            panic!("unexpected frame: {frame:?}");
        }
    }

    pub fn push(&self, text: impl Into<String>) {
        let _ = self.control.send(BackendControl::Push(text.into()));
    }

    pub fn close_all(&self) {
        let _ = self.control.send(BackendControl::Close);
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<BackendState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws_connection(state, socket))
}

async fn ws_connection(state: BackendState, socket: WebSocket) {
    state.connections.fetch_add(1, Ordering::SeqCst);
    let mut control = state.control.subscribe();
    let (mut sender, mut receiver) = socket.split();
    loop {
        tokio::select! {
            msg = receiver.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let _ = state.frames.send(text);
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            ctrl = control.recv() => match ctrl {
                Ok(BackendControl::Push(text)) => {
                    if sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Ok(BackendControl::Close) | Err(_) => {
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            },
        }
    }
}

/// Address nothing listens on.
pub async fn unused_ws_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);
    format!("ws://{addr}")
}

pub fn options(url: &str, reconnect_delay: Duration) -> ChannelOptions {
    ChannelOptions {
        url: url.to_string(),
        credential: "admin:123456".to_string(),
        reconnect: RetryPolicy::fixed(reconnect_delay),
    }
}

pub async fn wait_for_status(channel: &CommandChannel, status: ChannelStatus) {
    timeout(WAIT, async {
        while channel.status().await != status {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("channel never reached {status}"));
}
