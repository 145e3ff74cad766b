//! Shared harness: a real relay on an ephemeral port plus tungstenite peers.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use beach_ferry_core::{Handshake, Role};
use beach_ferry_server::{serve, AppState, RelayStrategy, ServerConfig, SessionRegistry, SlotPolicy};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

pub type Peer = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const STEP: Duration = Duration::from_secs(5);

pub struct TestRelay {
    pub addr: SocketAddr,
    pub state: Arc<AppState>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<std::io::Result<()>>,
}

impl TestRelay {
    pub async fn start(policy: SlotPolicy, strategy: RelayStrategy) -> Self {
        Self::start_with(policy, strategy, ServerConfig::default()).await
    }

    pub async fn start_with(policy: SlotPolicy, strategy: RelayStrategy, config: ServerConfig) -> Self {
        let registry = SessionRegistry::new(policy);
        let state = Arc::new(AppState::new(registry, strategy, &config));
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind listener");
        let addr = listener.local_addr().expect("local addr");
        let (tx, rx) = oneshot::channel();
        let task = tokio::spawn(serve(listener, Arc::clone(&state), async move {
            let _ = rx.await;
        }));
        Self {
            addr,
            state,
            shutdown: Some(tx),
            task,
        }
    }

    pub async fn connect(&self) -> Peer {
        let (peer, _) = connect_async(format!("ws://{}/ws/connect", self.addr))
            .await
            .expect("websocket connect");
        peer
    }

    /// Connects and completes the handshake, returning once the relay has
    /// seated the connection. Only meaningful for a slot that was empty.
    pub async fn join(&self, role: Role, token: &str) -> Peer {
        let mut peer = self.connect().await;
        send_handshake(&mut peer, role, token).await;
        let registry = self.state.registry.clone();
        let token = token.to_string();
        wait_until(move || slot_taken(&registry, &token, role)).await;
        peer
    }

    pub async fn get(&self, path: &str) -> String {
        let mut stream = TcpStream::connect(self.addr).await.expect("http connect");
        let request = format!("GET {path} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n", self.addr);
        stream.write_all(request.as_bytes()).await.expect("http write");
        let mut response = String::new();
        timeout(STEP, stream.read_to_string(&mut response))
            .await
            .expect("http response timed out")
            .expect("http read");
        response
    }

    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.task.abort();
    }
}

fn slot_taken(registry: &SessionRegistry, token: &str, role: Role) -> bool {
    registry.snapshot().iter().any(|session| {
        session.fingerprint == beach_ferry_core::session_fingerprint(token)
            && match role {
                Role::Client => session.client_bound,
                Role::Helper => session.helper_bound,
            }
    })
}

pub async fn send_handshake(peer: &mut Peer, role: Role, token: &str) {
    let json = Handshake::new(role, token).to_json();
    peer.send(Message::text(json)).await.expect("send handshake");
}

pub async fn send_text(peer: &mut Peer, text: &str) {
    peer.send(Message::text(text)).await.expect("send text");
}

/// Next data or close frame, skipping keep-alives. `None` when the stream ends.
pub async fn next_frame(peer: &mut Peer) -> Option<Message> {
    timeout(STEP, async {
        loop {
            match peer.next().await {
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                Some(Ok(message)) => return Some(message),
                Some(Err(_)) | None => return None,
            }
        }
    })
    .await
    .expect("timed out waiting for a frame")
}

pub async fn expect_text(peer: &mut Peer, expected: &str) {
    match next_frame(peer).await {
        Some(Message::Text(text)) => assert_eq!(text.as_str(), expected),
        other => panic!("expected text {expected:?}, got {other:?}"),
    }
}

pub async fn expect_close(peer: &mut Peer, code: u16, reason: &str) {
    match next_frame(peer).await {
        Some(Message::Close(Some(frame))) => {
            assert_eq!(u16::from(frame.code), code);
            assert_eq!(frame.reason.as_str(), reason);
        }
        other => panic!("expected close {code}, got {other:?}"),
    }
}

/// The relay refused the connection without saying why: a bare close frame
/// or a dropped stream, never a payload.
pub async fn expect_silent_close(peer: &mut Peer) {
    match next_frame(peer).await {
        Some(Message::Close(None)) | None => {}
        other => panic!("expected a silent close, got {other:?}"),
    }
}

/// Asserts nothing arrives for a short while.
pub async fn expect_quiet(peer: &mut Peer) {
    if let Ok(Some(Ok(message))) = timeout(Duration::from_millis(200), peer.next()).await {
        panic!("expected no traffic, got {message:?}");
    }
}

pub async fn wait_until<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + STEP;
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        sleep(Duration::from_millis(10)).await;
    }
}
