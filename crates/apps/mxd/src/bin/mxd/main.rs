use anyhow::{Context, Result};
use clap::Parser;
use mx_daemon::build_runtime;
use mx_daemon::config::NodeConfig;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "mxd")]
struct Args {
    #[arg(long, default_value = "mxd.toml")]
    config: PathBuf,
    /// Overrides `listen` from the config file.
    #[arg(long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = NodeConfig::from_path(&args.config)
        .with_context(|| format!("failed to load config {}", args.config.display()))?;
    let runtime = build_runtime(&config)?;
    log::info!("mxd: node thumbprint {}", runtime.thumbprint());

    if let Some(addr) = args.listen.or_else(|| config.listen.clone()) {
        let bound = runtime.listen(&addr).await?;
        log::info!("mxd: listening on {}", bound);
    }
    for (subscription, server) in config.poll_targets()? {
        log::info!("mxd: polling {} as {}", server, subscription);
        runtime.poll(&subscription, server)?;
    }

    tokio::signal::ctrl_c().await.context("failed to wait for ctrl-c")?;
    log::info!("mxd: shutting down");
    runtime.dispose().await;
    Ok(())
}
