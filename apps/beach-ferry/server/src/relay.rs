use std::future::Future;
use std::panic::AssertUnwindSafe;

use axum::extract::ws::Message;
use beach_ferry_core::{session_fingerprint, Role};
use futures_util::{FutureExt, Stream, StreamExt};
use metrics::counter;
use tracing::{debug, trace};

use crate::connection::ConnectionHandle;
use crate::frame;
use crate::registry::SessionRegistry;

/// Why a connection's relay loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayExit {
    /// The socket stream ended.
    EndOfStream,
    /// The peer sent a close frame.
    ClosedByPeer,
    /// The relay closed the connection (superseded, rejected, evicted).
    ClosedByRelay,
    ReceiveFailed,
    /// Scaled mode: subscribe or publish failed.
    BrokerUnavailable,
    /// Scaled mode: the subscription stream ended.
    SubscriptionEnded,
    /// Scaled mode: the connection's writer went away mid-delivery.
    ConnectionGone,
    /// A relay task panicked and was converted into teardown.
    Panicked,
}

impl RelayExit {
    pub fn label(self) -> &'static str {
        match self {
            RelayExit::EndOfStream => "end_of_stream",
            RelayExit::ClosedByPeer => "closed_by_peer",
            RelayExit::ClosedByRelay => "closed_by_relay",
            RelayExit::ReceiveFailed => "receive_failed",
            RelayExit::BrokerUnavailable => "broker_unavailable",
            RelayExit::SubscriptionEnded => "subscription_ended",
            RelayExit::ConnectionGone => "connection_gone",
            RelayExit::Panicked => "panicked",
        }
    }
}

/// What the receive side of a socket produced, reduced to what a relay
/// loop acts on.
pub(crate) enum Inbound {
    Data(Message),
    Skip,
    Stop(RelayExit),
}

pub(crate) fn classify(next: Option<Result<Message, axum::Error>>) -> Inbound {
    match next {
        None => Inbound::Stop(RelayExit::EndOfStream),
        Some(Err(err)) => {
            debug!(error = %err, "websocket receive failed");
            Inbound::Stop(RelayExit::ReceiveFailed)
        }
        Some(Ok(Message::Close(_))) => Inbound::Stop(RelayExit::ClosedByPeer),
        // Keep-alives are answered by the transport and never relayed.
        Some(Ok(Message::Ping(_) | Message::Pong(_))) => Inbound::Skip,
        Some(Ok(message)) => Inbound::Data(message),
    }
}

/// Direct mode: hand every frame from this connection to whoever holds the
/// opposite slot on this process, until the socket ends or the relay closes
/// the connection.
pub async fn run_direct<S>(
    registry: &SessionRegistry,
    token: &str,
    handle: &ConnectionHandle,
    mut inbound: S,
) -> RelayExit
where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    let role = handle.role();
    loop {
        let next = tokio::select! {
            biased;
            _ = handle.closed() => return RelayExit::ClosedByRelay,
            next = inbound.next() => next,
        };

        match classify(next) {
            Inbound::Data(message) => forward(registry, token, role, message),
            Inbound::Skip => continue,
            Inbound::Stop(exit) => return exit,
        }
    }
}

/// Runs one connection's relay loop, turning a panic inside it into
/// [`RelayExit::Panicked`] so the caller can tear the connection down as usual.
pub async fn contain_panic<F>(relay: F) -> RelayExit
where
    F: Future<Output = RelayExit>,
{
    match AssertUnwindSafe(relay).catch_unwind().await {
        Ok(exit) => exit,
        Err(_) => {
            counter!("beach_ferry_connection_panics_total", 1);
            RelayExit::Panicked
        }
    }
}

fn forward(registry: &SessionRegistry, token: &str, role: Role, message: Message) {
    registry.touch(token);

    let Some(peer) = registry.peer_of(token, role) else {
        trace!(
            session = %session_fingerprint(token),
            %role,
            "no peer bound; frame dropped"
        );
        return;
    };

    let bytes = frame::payload_len(&message);
    match peer.try_send(message) {
        Ok(()) => {
            counter!("beach_ferry_messages_relayed_total", 1, "mode" => "direct");
            counter!("beach_ferry_bytes_relayed_total", bytes as u64, "mode" => "direct");
        }
        Err(err) => {
            // The peer's own loop notices its disconnect; this side keeps going.
            debug!(
                session = %session_fingerprint(token),
                %role,
                peer_connection = %peer.id(),
                error = %err,
                "peer unreachable; frame dropped"
            );
            counter!(
                "beach_ferry_peer_unreachable_total",
                1,
                "reason" => err.metric_label()
            );
        }
    }
}
