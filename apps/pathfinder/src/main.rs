use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use pathfinder::agent::Agent;
use pathfinder::config::Config;
use pathfinder::control::ControlChannelClient;
use pathfinder::logging::{self, LogConfig, LogLevel};
use pathfinder::script::UnavailableRunner;
use pathfinder_hw::DisabledHardware;
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "pathfinder", version)]
struct Cli {
    /// Control server URL (overrides PATHFINDER_SERVER_URL)
    #[arg(long)]
    server: Option<String>,

    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    log_level: LogLevel,

    /// Write logs to a file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    if let Err(err) = logging::init(&LogConfig {
        level: cli.log_level,
        file: cli.log_file.clone(),
    }) {
        eprintln!("failed to initialize logging: {err}");
        std::process::exit(1);
    }

    let mut config = Config::from_env();
    if let Some(server) = cli.server {
        config.server_url = server;
    }
    info!(
        robot_id = %config.robot_id,
        robot_name = %config.robot_name,
        server = %config.server_url,
        "starting pathfinder agent"
    );

    // The concrete driver and interpreter are wired in by the kit
    // integration; this binary runs with the capability seams only.
    if config.hardware_enabled {
        warn!("PATHFINDER_HARDWARE is set but no driver is linked; running disabled");
    }
    let hardware = DisabledHardware::shared();
    let runner = Arc::new(UnavailableRunner);

    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (agent, events_tx) = Agent::new(runner, hardware, outbound_tx);
    let client = ControlChannelClient::new(config, events_tx, outbound_rx);

    tokio::select! {
        _ = agent.run() => {}
        _ = client.run() => {}
    }
}
