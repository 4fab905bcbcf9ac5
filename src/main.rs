use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use wiremesh::{Server, ServerConfig};

#[derive(Parser, Debug)]
#[command(name = "wiremesh")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Name of this server; scopes all broker topics.
    #[arg(long, env = "SERVER_NAME")]
    server_name: String,

    /// Stable identity of this server process.
    #[arg(long, env = "NODE_ID")]
    node_id: String,

    /// Admin master key.
    #[arg(long, env = "MASTER_KEY")]
    master_key: Option<String>,

    /// Broker endpoint agents connect to.
    #[arg(long, env = "BROKER_ENDPOINT", default_value = "127.0.0.1:1883")]
    broker_endpoint: String,

    #[arg(long, env = "BROKER_USER", default_value = "")]
    broker_user: String,

    #[arg(long, env = "BROKER_PASS", default_value = "")]
    broker_pass: String,

    /// Directory for identity material (seed, root CA, leaf certs).
    #[arg(long, env = "DATA_DIR", default_value = wiremesh::config::DEFAULT_DATA_DIR)]
    data_dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let config = ServerConfig {
        server_name: args.server_name,
        node_id: args.node_id,
        master_key: args.master_key,
        broker_endpoint: args.broker_endpoint,
        broker_user: args.broker_user,
        broker_pass: args.broker_pass,
        data_dir: args.data_dir,
        version: env!("CARGO_PKG_VERSION").to_string(),
    };

    let server = Server::start(config).await?;
    info!("initialization complete");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received shutdown signal, exiting gracefully");
            let _ = shutdown_tx.send(true);
        }
    });

    server.run(shutdown_rx).await
}
