use anyhow::Result;
use clap::Parser;

use huddle_signal::{
    app,
    cli::{self, Cli, Commands},
    config::Config,
    telemetry::{self, Telemetry},
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Commands::Probe {
        url,
        token,
        wait_secs,
    }) = cli.command
    {
        telemetry::init_tracing("warn")?;
        return cli::run_probe(url, token, wait_secs).await;
    }

    let telemetry = Telemetry::init()?;
    let config = Config::try_from(cli.server)?;

    app::run(config, Some(telemetry.metrics_handle())).await
}
