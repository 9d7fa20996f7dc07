use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio::io::BufReader;
use tracing::{info, warn};

use file_exchange::{
    cli::{Cli, ClientArgs, Command, ServerArgs},
    client::Reconnector,
    listener::Server,
    store::FileStore,
};

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let runtime = tokio::runtime::Runtime::new()?;
    let result = match cli.command {
        Command::Server(args) => runtime.block_on(run_server(args)),
        Command::Client(args) => runtime.block_on(run_client(args)),
    };

    // A stdin read in flight cannot be cancelled; exit without joining it.
    runtime.shutdown_background();
    result
}

async fn run_server(args: ServerArgs) -> Result<()> {
    let store = FileStore::open(args.storage_dir, args.clients_dir).await?;
    let server = Server::bind(args.listen, store).await?;
    let addr = server.local_addr()?;
    info!("server listening on {}", addr);
    if let Err(err) = server.run_until_ctrl_c().await {
        warn!("server exited with error: {err:?}");
        return Err(err);
    }
    Ok(())
}

async fn run_client(args: ClientArgs) -> Result<()> {
    let mut client = Reconnector::new(args.server, Duration::from_secs(args.retry_secs));
    client
        .run(
            BufReader::new(tokio::io::stdin()),
            tokio::io::stdout(),
            async {
                if let Err(err) = tokio::signal::ctrl_c().await {
                    warn!(error = ?err, "failed to install ctrl-c handler");
                }
            },
        )
        .await
}
