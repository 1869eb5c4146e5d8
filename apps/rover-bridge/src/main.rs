use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;

use commands::{GetArgs, InfoArgs, RunArgs, SchemaArgs, SetArgs};

#[derive(Parser)]
#[command(
    name = "rover-bridge",
    version,
    about = "Telemetry and configuration bridge for networked GNSS receivers"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream telemetry and polled resources as JSON lines until interrupted
    Run(RunArgs),
    /// Print the device identity from /info
    Info(InfoArgs),
    /// Print a configuration document
    Get(GetArgs),
    /// Merge a partial JSON patch into a configuration document
    Set(SetArgs),
    /// Print or write the configuration file JSON schema
    Schema(SchemaArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    rover_otel::init();
    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => commands::run::execute(args).await,
        Commands::Info(args) => commands::info::execute(args).await,
        Commands::Get(args) => commands::config::get(args).await,
        Commands::Set(args) => commands::config::set(args).await,
        Commands::Schema(args) => commands::schema::execute(args),
    }
}
