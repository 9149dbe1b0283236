use anyhow::Result;
use clap::Parser;
use tracing::info;
use tripteller_presence_server::{
    config::{Cli, ServerConfig},
    telemetry::Telemetry,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = ServerConfig::try_from(cli)?;
    let telemetry = Telemetry::init(config.otel_stdout)?;

    info!(
        listen_addr = %config.listen_addr,
        require_identity = config.presence.require_identity,
        reap_interval_secs = config.presence.reap_interval.as_secs(),
        subject_stale_secs = config.presence.subject_stale_timeout.as_secs(),
        "starting tripteller presence server"
    );

    tripteller_presence_server::run(config, Some(telemetry.metrics_handle())).await
}
