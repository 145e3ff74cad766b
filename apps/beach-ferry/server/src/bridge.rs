//! Scaled mode: each connection becomes a publisher on its own role's channel
//! and a subscriber on its peer's, so the two ends of a session may live on
//! different relay processes.

use std::sync::Arc;

use axum::extract::ws::Message;
use beach_ferry_core::{session_fingerprint, ChannelPair};
use ferry_bus::{Bus, Subscription};
use futures_util::{Stream, StreamExt};
use metrics::counter;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::connection::ConnectionHandle;
use crate::frame;
use crate::registry::SessionRegistry;
use crate::relay::{classify, Inbound, RelayExit};

/// Runs the uplink and downlink pumps for one bound connection. Returns as
/// soon as either pump ends or the relay closes the connection; the other
/// pump is aborted and the subscription released.
pub async fn run_bridge<S>(
    bus: Arc<dyn Bus>,
    registry: SessionRegistry,
    token: String,
    handle: ConnectionHandle,
    inbound: S,
) -> RelayExit
where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin + Send + 'static,
{
    let role = handle.role();
    let channels = ChannelPair::for_session(&token);

    let subscription = match bus.subscribe(channels.inbound(role)).await {
        Ok(subscription) => subscription,
        Err(err) => {
            warn!(
                session = %session_fingerprint(&token),
                %role,
                error = %err,
                "subscribe failed"
            );
            counter!("beach_ferry_broker_errors_total", 1, "op" => "subscribe");
            return RelayExit::BrokerUnavailable;
        }
    };

    let mut pumps = JoinSet::new();
    pumps.spawn(uplink(
        bus,
        registry.clone(),
        token.clone(),
        channels.outbound(role).to_string(),
        inbound,
    ));
    pumps.spawn(downlink(subscription, registry, token.clone(), handle.clone()));

    let exit = tokio::select! {
        joined = pumps.join_next() => match joined {
            Some(Ok(exit)) => exit,
            Some(Err(err)) => {
                warn!(
                    session = %session_fingerprint(&token),
                    %role,
                    error = %err,
                    "relay pump failed"
                );
                if err.is_panic() {
                    counter!("beach_ferry_connection_panics_total", 1);
                    RelayExit::Panicked
                } else {
                    RelayExit::ClosedByRelay
                }
            }
            None => RelayExit::EndOfStream,
        },
        _ = handle.closed() => RelayExit::ClosedByRelay,
    };

    pumps.abort_all();
    debug!(
        session = %session_fingerprint(&token),
        %role,
        exit = exit.label(),
        "bridge finished"
    );
    exit
}

async fn uplink<S>(
    bus: Arc<dyn Bus>,
    registry: SessionRegistry,
    token: String,
    topic: String,
    mut inbound: S,
) -> RelayExit
where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    loop {
        let message = match classify(inbound.next().await) {
            Inbound::Data(message) => message,
            Inbound::Skip => continue,
            Inbound::Stop(exit) => return exit,
        };
        registry.touch(&token);

        let Some(envelope) = frame::encode(&message) else {
            continue;
        };
        let bytes = envelope.len().saturating_sub(1);
        if let Err(err) = bus.publish(&topic, envelope).await {
            warn!(
                session = %session_fingerprint(&token),
                error = %err,
                "publish failed"
            );
            counter!("beach_ferry_broker_errors_total", 1, "op" => "publish");
            return RelayExit::BrokerUnavailable;
        }
        counter!("beach_ferry_messages_relayed_total", 1, "mode" => "scaled");
        counter!("beach_ferry_bytes_relayed_total", bytes as u64, "mode" => "scaled");
    }
}

async fn downlink(
    mut subscription: Subscription,
    registry: SessionRegistry,
    token: String,
    handle: ConnectionHandle,
) -> RelayExit {
    while let Some(delivery) = subscription.recv().await {
        let Some(message) = frame::decode(&delivery.payload) else {
            warn!(
                session = %session_fingerprint(&token),
                "discarding undecodable bus payload"
            );
            continue;
        };
        // Traffic toward this side counts as activity for this process's
        // registry, which never sees the peer's uplink.
        registry.touch(&token);
        if handle.send(message).await.is_err() {
            return RelayExit::ConnectionGone;
        }
    }
    RelayExit::SubscriptionEnded
}
