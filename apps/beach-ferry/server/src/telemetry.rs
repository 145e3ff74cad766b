use anyhow::{Context, Result};
use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub struct Telemetry {
    metrics_handle: PrometheusHandle,
}

impl Telemetry {
    pub fn init() -> Result<Self> {
        let metrics_handle = PrometheusBuilder::new()
            .install_recorder()
            .context("failed to install Prometheus metrics recorder")?;

        tracing_subscriber::registry()
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .try_init()
            .context("failed to initialise tracing subscriber")?;

        describe_metrics();

        Ok(Self { metrics_handle })
    }

    pub fn metrics_handle(&self) -> PrometheusHandle {
        self.metrics_handle.clone()
    }
}

fn describe_metrics() {
    describe_counter!(
        "beach_ferry_connections_total",
        "Connections that completed a handshake and took a role slot"
    );
    describe_counter!(
        "beach_ferry_connections_closed_total",
        "Bound connections torn down, by exit reason"
    );
    describe_counter!(
        "beach_ferry_handshakes_failure_total",
        "Connections closed silently because the handshake was refused"
    );
    describe_counter!(
        "beach_ferry_slot_conflicts_total",
        "Binds that found their role slot occupied"
    );
    describe_counter!(
        "beach_ferry_messages_relayed_total",
        "Frames handed to a peer (direct) or published (scaled)"
    );
    describe_counter!("beach_ferry_bytes_relayed_total", "Payload bytes relayed");
    describe_counter!(
        "beach_ferry_peer_unreachable_total",
        "Direct-mode frames dropped because the peer could not take them"
    );
    describe_counter!(
        "beach_ferry_sessions_evicted_total",
        "Sessions evicted by the inactivity reaper"
    );
    describe_counter!(
        "beach_ferry_broker_errors_total",
        "Pub/sub operations that failed in scaled mode"
    );
    describe_counter!(
        "beach_ferry_connection_panics_total",
        "Relay tasks that panicked and were torn down"
    );
    describe_gauge!("beach_ferry_sessions_active", "Sessions held on this process");
}
