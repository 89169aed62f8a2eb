//! bgpmon: CLI client for the bgpmond RPC surface.
//!
//! Exit codes: 0 on success, 1 on client-side errors (bad arguments,
//! connection failures), 2 when the server reports an error.

use clap::{Parser, Subcommand};
use tracing::Level;

mod commands;

use commands::close::CloseArgs;
use commands::module::ModuleCommands;
use commands::open::OpenArgs;
use commands::Endpoint;

#[derive(Parser)]
#[clap(author, version, about = "Client for the bgpmond BGP monitoring daemon", long_about = None)]
#[clap(propagate_version = true)]
struct Cli {
    /// bgpmond host; BGPMOND_HOST overrides the default
    #[clap(long, global = true)]
    host: Option<String>,

    /// bgpmond port; BGPMOND_PORT overrides the default
    #[clap(long, global = true)]
    port: Option<u16>,

    /// Print debug information
    #[clap(long, global = true)]
    debug: bool,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Open a database session on the bgpmond and print its allocated ID.
    Open(OpenArgs),

    /// Close an open session.
    Close(CloseArgs),

    /// Inspect and run bgpmond modules.
    Module {
        #[clap(subcommand)]
        commands: ModuleCommands,
    },
}

fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    if cli.debug {
        tracing_subscriber::fmt().with_max_level(Level::INFO).init();
    }

    let endpoint = Endpoint::resolve(cli.host, cli.port);

    let code = match cli.command {
        Commands::Open(args) => commands::open::run(&endpoint, args),
        Commands::Close(args) => commands::close::run(&endpoint, args),
        Commands::Module { commands } => commands::module::run(&endpoint, commands),
    };
    std::process::exit(code);
}
