use std::{net::SocketAddr, path::PathBuf};

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the exchange server, accepting TCP connections from peers.
    Server(ServerArgs),
    /// Connect to a server and forward stdin lines as commands.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Socket address the server should bind to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "0.0.0.0:12345")]
    pub listen: SocketAddr,

    /// Directory holding files uploaded with `/store`.
    #[arg(long, default_value = "server_files")]
    pub storage_dir: PathBuf,

    /// Directory under which each handle gets its `<handle>_files` area.
    #[arg(long, default_value = ".")]
    pub clients_dir: PathBuf,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Address of the server to connect to.
    #[arg(long, default_value = "127.0.0.1:12345")]
    pub server: String,

    /// Seconds to wait between connection attempts.
    #[arg(long, default_value_t = 10)]
    pub retry_secs: u64,
}
