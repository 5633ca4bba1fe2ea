use std::collections::BTreeMap;

use clap::Parser;
use handoff::{Daemon, DaemonArgs};

mod service;

/// Hello-world HTTP service that can be restarted and upgraded without
/// dropping connections.
#[derive(Parser)]
#[command(name = "hellod", version)]
struct Cli {
    #[arg(long, default_value_t = 8080)]
    web_port: u16,

    #[arg(long, default_value_t = 9090)]
    metrics_port: u16,

    #[command(flatten)]
    daemon: DaemonArgs,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let cli = Cli::parse();

    let ports = BTreeMap::from([
        (service::WEB.to_string(), cli.web_port),
        (service::METRICS.to_string(), cli.metrics_port),
    ]);
    Daemon::from_env(cli.daemon)
        .bootstrap(ports, service::serve)
        .await?;
    Ok(())
}
