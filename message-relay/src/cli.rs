use clap::{Args, Parser, Subcommand};

use crate::config::{AgentConfig, RelayConfig};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay, routing messages between registered clients.
    Serve(ServeArgs),
    /// Register with a relay and exchange messages from the terminal.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub relay: RelayConfig,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Username to register under.
    #[arg(long)]
    pub username: String,

    #[command(flatten)]
    pub relay: AgentConfig,

    /// Print delivered messages as JSON objects, one per line.
    #[arg(long)]
    pub json: bool,
}
