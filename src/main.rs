//! `rstash`: caching asset proxy.
//!
//! ```text
//! rstash --config settings.json --cache-dir ~/.cache/rstash
//! curl -i http://127.0.0.1:9370/assets/index-4f1a.js
//! ```

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use rstash::config::{Overrides, ProxyConfig};
use rstash::{logging, proxy};

#[derive(Parser)]
#[command(name = "rstash")]
#[command(version)]
#[command(about = "Caching reverse proxy for immutable web assets")]
struct Cli {
    /// JSON settings file; defaults apply when it does not exist
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address, e.g. 127.0.0.1:9370
    #[arg(short, long)]
    bind: Option<String>,

    /// Upstream origin, tried in the order given (repeatable)
    #[arg(short, long = "upstream", value_name = "URL")]
    upstreams: Vec<String>,

    /// Persist cached assets in this directory
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// trace, debug, info, warn or error
    #[arg(short, long)]
    log_level: Option<String>,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            bind: self.bind.clone(),
            upstreams: self.upstreams.clone(),
            cache_dir: self.cache_dir.clone(),
            log_level: self.log_level.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = ProxyConfig::load(cli.config.as_deref())
        .with_context(|| format!("loading settings from {:?}", cli.config))?;
    config.apply(cli.overrides());
    config.validate().context("invalid settings")?;

    logging::init(&config.log_level);

    proxy::serve(&config, shutdown_signal())
        .await
        .context("proxy stopped")?;

    tracing::info!("rstash stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "cannot listen for Ctrl-C, running until killed");
        std::future::pending::<()>().await;
    }
}
