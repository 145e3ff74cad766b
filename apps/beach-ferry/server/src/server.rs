use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use beach_ferry_core::{parse_handshake, session_fingerprint, Handshake, HandshakeError};
use ferry_bus::{Bus, RedisBus};
use futures_util::{stream::SplitStream, Sink, SinkExt, Stream, StreamExt};
use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use serde_json::json;
use tokio::{
    net::TcpListener,
    signal,
    sync::mpsc,
    task::JoinHandle,
    time::timeout,
};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

use crate::bridge::run_bridge;
use crate::config::{RelayMode, ServerConfig};
use crate::connection::{CloseSignal, ConnectionHandle};
use crate::reaper::spawn_reaper;
use crate::registry::{BindOutcome, SessionRegistry, Unbound};
use crate::relay::{contain_panic, run_direct, RelayExit};

/// How long a finished connection's writer gets to flush its close frame.
const WRITER_GRACE: Duration = Duration::from_secs(1);

/// Forwarding path shared by every connection on this process.
pub enum RelayStrategy {
    Direct,
    PubSub(Arc<dyn Bus>),
}

impl RelayStrategy {
    pub fn label(&self) -> &'static str {
        match self {
            RelayStrategy::Direct => RelayMode::Direct.label(),
            RelayStrategy::PubSub(_) => RelayMode::Scaled.label(),
        }
    }
}

pub struct AppState {
    pub registry: SessionRegistry,
    pub strategy: RelayStrategy,
    pub handshake_timeout: Duration,
    pub outbound_buffer: usize,
    metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(registry: SessionRegistry, strategy: RelayStrategy, config: &ServerConfig) -> Self {
        Self {
            registry,
            strategy,
            handshake_timeout: config.handshake_timeout,
            outbound_buffer: config.outbound_buffer,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    mode: &'static str,
    slot_policy: &'static str,
    active_sessions: usize,
    sessions: Vec<SessionStatsEntry>,
}

#[derive(Debug, Serialize)]
struct SessionStatsEntry {
    session: String,
    client: bool,
    helper: bool,
    idle_secs: u64,
}

pub async fn run(config: ServerConfig, metrics: PrometheusHandle) -> Result<()> {
    let strategy = match config.mode {
        RelayMode::Direct => RelayStrategy::Direct,
        RelayMode::Scaled => {
            let bus = RedisBus::connect(&config.redis_url)
                .await
                .context("failed to connect to redis")?;
            RelayStrategy::PubSub(Arc::new(bus))
        }
    };

    let registry = SessionRegistry::new(config.slot_policy);
    let state = Arc::new(AppState::new(registry.clone(), strategy, &config).with_metrics(metrics));
    let reaper_handle = spawn_reaper(registry, config.reap_interval, config.idle_timeout);

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;

    info!("beach-ferry listening on {}", config.listen_addr);

    serve(listener, state, shutdown_signal())
        .await
        .context("server shutdown with error")?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; sleeping for graceful period"
    );
    reaper_handle.abort();
    tokio::time::sleep(config.shutdown_grace).await;
    info!("graceful shutdown complete");

    Ok(())
}

/// Serves the relay on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: Arc<AppState>, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/debug/stats", get(stats_handler))
        .route("/metrics", get(metrics_handler))
        .route("/ws/connect", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({ "status": "ok", "mode": state.strategy.label() }))
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let sessions: Vec<SessionStatsEntry> = state
        .registry
        .snapshot()
        .into_iter()
        .map(|entry| SessionStatsEntry {
            session: entry.fingerprint,
            client: entry.client_bound,
            helper: entry.helper_bound,
            idle_secs: entry.idle.as_secs(),
        })
        .collect();

    Json(StatsResponse {
        mode: state.strategy.label(),
        slot_policy: state.registry.policy().label(),
        active_sessions: sessions.len(),
        sessions,
    })
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn ws_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, remote_addr))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, remote_addr: SocketAddr) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let handshake = match await_handshake(&mut ws_rx, state.handshake_timeout).await {
        Ok(handshake) => handshake,
        Err(err) => {
            // Same bare close for every reason; the peer learns nothing.
            counter!(
                "beach_ferry_handshakes_failure_total",
                1,
                "reason" => err.metric_label()
            );
            debug!(remote = %remote_addr, reason = err.metric_label(), "handshake refused");
            let _ = timeout(WRITER_GRACE, ws_tx.send(Message::Close(None))).await;
            return;
        }
    };

    let session = session_fingerprint(&handshake.token);
    let (outbound, queue) = mpsc::channel(state.outbound_buffer);
    let handle = ConnectionHandle::new(handshake.role, outbound);
    let writer = spawn_writer(ws_tx, queue, handle.close_signal());
    let role = handle.role();
    let connection_id = handle.id();

    match state.registry.bind(&handshake.token, &handle) {
        BindOutcome::Rejected => {
            counter!("beach_ferry_slot_conflicts_total", 1, "policy" => "reject");
            info!(
                session = %session,
                %role,
                %connection_id,
                remote = %remote_addr,
                "role already occupied; connection rejected"
            );
            drop(handle);
            finish_writer(writer).await;
            return;
        }
        BindOutcome::Bound { created, replaced } => {
            if let Some(stale) = replaced {
                counter!("beach_ferry_slot_conflicts_total", 1, "policy" => "replace");
                info!(
                    session = %session,
                    %role,
                    superseded = %stale.id(),
                    "previous occupant superseded"
                );
            }
            counter!("beach_ferry_connections_total", 1, "role" => role.as_str());
            gauge!("beach_ferry_sessions_active", state.registry.len() as f64);
            info!(
                session = %session,
                %role,
                %connection_id,
                remote = %remote_addr,
                created,
                mode = state.strategy.label(),
                "connection bound"
            );
        }
    }

    let exit = contain_panic(relay(&state, &handshake, &handle, ws_rx)).await;
    if exit == RelayExit::Panicked {
        error!(session = %session, %role, %connection_id, "relay task panicked");
    }

    let unbound = state.registry.unbind(&handshake.token, role, connection_id);
    gauge!("beach_ferry_sessions_active", state.registry.len() as f64);
    counter!(
        "beach_ferry_connections_closed_total",
        1,
        "reason" => exit.label()
    );

    // No-op if the relay already closed it with a reason.
    handle.close_silently();
    drop(handle);
    finish_writer(writer).await;

    info!(
        session = %session,
        %role,
        %connection_id,
        exit = exit.label(),
        session_removed = matches!(unbound, Unbound::SessionRemoved),
        "connection closed"
    );
}

async fn relay(
    state: &AppState,
    handshake: &Handshake,
    handle: &ConnectionHandle,
    inbound: SplitStream<WebSocket>,
) -> RelayExit {
    match &state.strategy {
        RelayStrategy::Direct => {
            run_direct(&state.registry, &handshake.token, handle, inbound).await
        }
        RelayStrategy::PubSub(bus) => {
            run_bridge(
                Arc::clone(bus),
                state.registry.clone(),
                handshake.token.clone(),
                handle.clone(),
                inbound,
            )
            .await
        }
    }
}

/// Waits for the first data frame and parses it. Keep-alives before it are
/// skipped; anything else that ends the wait counts as a refusal.
async fn await_handshake<S>(inbound: &mut S, deadline: Duration) -> Result<Handshake, HandshakeError>
where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    let first = timeout(deadline, async {
        loop {
            match inbound.next().await {
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                other => break other,
            }
        }
    })
    .await
    .map_err(|_| HandshakeError::TimedOut)?;

    match first {
        Some(Ok(Message::Text(text))) => parse_handshake(text.as_bytes()),
        Some(Ok(Message::Binary(bytes))) => parse_handshake(&bytes),
        _ => Err(HandshakeError::ClosedEarly),
    }
}

/// Drains the outbound queue into the socket until the connection is closed,
/// then sends the close frame recorded on `signal`. A close therefore never
/// waits behind queued data.
fn spawn_writer<S>(
    mut sink: S,
    mut queue: mpsc::Receiver<Message>,
    signal: CloseSignal,
) -> JoinHandle<()>
where
    S: Sink<Message> + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = signal.cancelled() => {
                    let _ = sink.send(signal.close_message()).await;
                    break;
                }
                next = queue.recv() => match next {
                    Some(message) => {
                        if sink.send(message).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
    })
}

async fn finish_writer(writer: JoinHandle<()>) {
    let abort = writer.abort_handle();
    if timeout(WRITER_GRACE, writer).await.is_err() {
        abort.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::SlotPolicy;
    use beach_ferry_core::{CloseReason, Role};
    use futures_util::{sink, stream};

    fn frames(items: Vec<Message>) -> impl Stream<Item = Result<Message, axum::Error>> + Unpin {
        stream::iter(items.into_iter().map(Ok))
    }

    #[tokio::test]
    async fn handshake_skips_keepalives() {
        let mut inbound = frames(vec![
            Message::Ping(vec![1]),
            Message::Text(r#"{"role":"helper","password":"abc123"}"#.into()),
        ]);
        let handshake = await_handshake(&mut inbound, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(handshake, Handshake::new(Role::Helper, "abc123"));
    }

    #[tokio::test]
    async fn handshake_accepts_binary_json() {
        let mut inbound = frames(vec![Message::Binary(
            br#"{"role":"client","password":"abc123"}"#.to_vec(),
        )]);
        let handshake = await_handshake(&mut inbound, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(handshake.role, Role::Client);
    }

    #[tokio::test]
    async fn handshake_refusals() {
        let mut closed = frames(vec![Message::Close(None)]);
        assert_eq!(
            await_handshake(&mut closed, Duration::from_secs(1)).await,
            Err(HandshakeError::ClosedEarly)
        );

        let mut empty = frames(vec![]);
        assert_eq!(
            await_handshake(&mut empty, Duration::from_secs(1)).await,
            Err(HandshakeError::ClosedEarly)
        );

        let mut garbage = frames(vec![Message::Text("hello".into())]);
        assert_eq!(
            await_handshake(&mut garbage, Duration::from_secs(1)).await,
            Err(HandshakeError::Malformed)
        );
    }

    /// Socket stand-in that records every frame the writer emits.
    fn wire() -> (
        impl Sink<Message> + Unpin + Send + 'static,
        mpsc::UnboundedReceiver<Message>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = sink::unfold(tx, |tx, message: Message| async move {
            let _ = tx.send(message);
            Ok::<_, axum::Error>(tx)
        });
        (Box::pin(sink), rx)
    }

    #[tokio::test]
    async fn superseded_close_reaches_a_connection_with_a_full_queue() {
        let registry = SessionRegistry::new(SlotPolicy::Replace);
        let (outbound, queue) = mpsc::channel(2);
        let stale = ConnectionHandle::new(Role::Helper, outbound);
        registry.bind("abc123", &stale);
        stale.try_send(Message::Text("f1".into())).unwrap();
        stale.try_send(Message::Text("f2".into())).unwrap();

        let (fresh_outbound, _fresh_queue) = mpsc::channel(2);
        let fresh = ConnectionHandle::new(Role::Helper, fresh_outbound);
        registry.bind("abc123", &fresh);
        assert!(stale.is_closed());

        let (sink, mut delivered) = wire();
        spawn_writer(sink, queue, stale.close_signal()).await.unwrap();

        let mut frames = Vec::new();
        while let Ok(message) = delivered.try_recv() {
            frames.push(message);
        }
        match frames.last() {
            Some(Message::Close(Some(frame))) => {
                assert_eq!(frame.code, CloseReason::Superseded.code());
                assert_eq!(frame.reason, CloseReason::Superseded.reason());
            }
            other => panic!("expected superseded close, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn writer_flushes_data_then_closes_silently() {
        let (outbound, queue) = mpsc::channel(4);
        let handle = ConnectionHandle::new(Role::Client, outbound);
        let (sink, mut delivered) = wire();
        let writer = spawn_writer(sink, queue, handle.close_signal());

        handle.try_send(Message::Text("frame1".into())).unwrap();
        assert!(matches!(delivered.recv().await, Some(Message::Text(t)) if t == "frame1"));

        handle.close_silently();
        writer.await.unwrap();
        assert!(matches!(delivered.recv().await, Some(Message::Close(None))));
        assert!(delivered.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn handshake_times_out() {
        let mut silent = stream::pending::<Result<Message, axum::Error>>();
        assert_eq!(
            await_handshake(&mut silent, Duration::from_secs(10)).await,
            Err(HandshakeError::TimedOut)
        );
    }
}
