use std::time::Duration;

use beach_ferry_core::session_fingerprint;
use metrics::{counter, gauge};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::registry::SessionRegistry;

/// Backstop for sessions whose sockets vanished without a close (network
/// partitions, killed processes). Clean disconnects never wait for this.
pub fn spawn_reaper(
    registry: SessionRegistry,
    interval: Duration,
    idle_timeout: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; skip it.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            reap_once(&registry, idle_timeout);
        }
    })
}

/// Runs one sweep and records what it evicted.
pub fn reap_once(registry: &SessionRegistry, idle_timeout: Duration) -> usize {
    let evicted = registry.sweep(Instant::now(), idle_timeout);
    if evicted.is_empty() {
        debug!(active_sessions = registry.len(), "reaper sweep found nothing idle");
        return 0;
    }

    for token in &evicted {
        info!(
            session = %session_fingerprint(token),
            idle_timeout_secs = idle_timeout.as_secs(),
            "evicted idle session"
        );
    }
    counter!("beach_ferry_sessions_evicted_total", evicted.len() as u64);
    gauge!("beach_ferry_sessions_active", registry.len() as f64);
    evicted.len()
}
