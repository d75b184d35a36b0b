use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use floodmesh::{Node, NodeConfig};

#[derive(Parser, Debug)]
#[command(name = "floodmesh")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML file with `listen` and `peers`
    config: PathBuf,

    /// Log filter used when RUST_LOG is unset
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let config = NodeConfig::load(&args.config)?;
    let terminate = termination_signal()?;

    let node = Node::bind(config).await?;
    info!(
        listen = %node.local_addr(),
        peers = node.peers().len(),
        "node started"
    );

    node.run_until(terminate).await;
    info!("bye");
    Ok(())
}

/// Resolves on SIGTERM or Ctrl+C; both take the same shutdown path.
#[cfg(unix)]
fn termination_signal() -> Result<impl std::future::Future<Output = ()>> {
    use anyhow::Context;
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    Ok(async move {
        tokio::select! {
            _ = sigterm.recv() => {}
            _ = tokio::signal::ctrl_c() => {}
        }
    })
}

#[cfg(not(unix))]
fn termination_signal() -> Result<impl std::future::Future<Output = ()>> {
    Ok(async {
        let _ = tokio::signal::ctrl_c().await;
    })
}
