//! bgpmond daemon: serves the session and module RPC surface.

use bgpmond::server::{start_server, Server, ServerConfig};
use bgpmond::{modules, BgpmondConfig};
use clap::Parser;
use tracing::Level;

#[derive(Parser)]
#[clap(author, version, about = "BGP monitoring storage and query daemon", long_about = None)]
struct Cli {
    /// configuration file path, by default $HOME/.bgpmond.toml is used
    #[clap(short, long)]
    config: Option<String>,

    /// Address to bind the RPC endpoint to (overrides the config file)
    #[clap(long)]
    address: Option<String>,

    /// Port for the RPC endpoint (overrides the config file)
    #[clap(long)]
    port: Option<u16>,

    /// Print debug information
    #[clap(long)]
    debug: bool,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = match BgpmondConfig::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    let level = if cli.debug || config.debug {
        Level::DEBUG
    } else {
        Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let server_config = ServerConfig {
        address: cli.address.unwrap_or_else(|| config.address.clone()),
        port: cli.port.unwrap_or(config.port),
        ..ServerConfig::default()
    };

    let server = Server::new(config);
    modules::register_all(&server);

    if let Err(err) = start_server(server, server_config).await {
        eprintln!("ERROR: {}", err);
        std::process::exit(2);
    }
}
