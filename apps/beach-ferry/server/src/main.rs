use anyhow::Result;
use beach_ferry_server::{server, telemetry::Telemetry, Cli, ServerConfig};
use clap::Parser;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = Telemetry::init()?;

    let cli = Cli::parse();
    let config = ServerConfig::try_from(cli)?;
    info!(
        listen_addr = %config.listen_addr,
        mode = config.mode.label(),
        slot_policy = config.slot_policy.label(),
        idle_timeout_secs = config.idle_timeout.as_secs(),
        "starting beach-ferry server"
    );

    server::run(config, telemetry.metrics_handle()).await
}
