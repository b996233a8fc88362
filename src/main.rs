use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use sheetcache::{
    cache::ResultCache,
    config::Config,
    convert::{CsvConverter, LocalFileSystem},
    dispatch::Dispatcher,
    http::Request,
    logging,
    server::Server,
};

#[derive(Parser)]
#[command(name = "sheetcache")]
#[command(version)]
#[command(about = "Serves CSV files as cached spreadsheets over HTTP")]
#[command(long_about = None)]
struct Cli {
    /// Configuration file path (JSON)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Listening address, overrides the config file
    #[arg(short, long, value_name = "ADDR")]
    bind: Option<String>,

    /// Directory to serve CSV files from, overrides the config file
    #[arg(short, long, value_name = "DIR")]
    root: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::get(cli.config.as_deref()).context("loading configuration")?;
    if let Some(bind) = cli.bind {
        config.bind = bind;
    }
    if let Some(root) = cli.root {
        config.root = root;
    }
    config.validate().context("validating configuration")?;

    logging::init(&config.logging);
    info!("Starting sheetcache v{}", env!("CARGO_PKG_VERSION"));
    info!(root = %config.root.display(), "serving CSV files");

    let cache = Arc::new(ResultCache::new(config.cache));
    let fs = Arc::new(LocalFileSystem);
    let converter = Arc::new(CsvConverter::new(fs.clone()));
    let dispatcher = Arc::new(Dispatcher::new(
        config.root.clone(),
        Arc::clone(&cache),
        fs,
        converter,
    ));

    let sweeper = spawn_sweeper(Arc::clone(&cache));

    let server = Server::bind_with(&config.bind, &config.server).await?;
    server
        .run_until(
            move |req: Request| {
                let dispatcher = Arc::clone(&dispatcher);
                async move { dispatcher.serve(req).await }
            },
            shutdown_signal(),
        )
        .await?;

    sweeper.abort();
    info!(entries = cache.len(), "sheetcache stopped");
    Ok(())
}

/// Periodically drops expired entries so idle keys do not hold memory until
/// their next lookup.
fn spawn_sweeper(cache: Arc<ResultCache>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(cache.config().sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            match cache.purge_expired() {
                Ok(0) => {}
                Ok(purged) => debug!(purged, remaining = cache.len(), "swept expired entries"),
                Err(e) => warn!(error = %e, "cache sweep skipped"),
            }
        }
    })
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("received Ctrl-C"),
        Err(e) => {
            warn!(error = %e, "failed to listen for Ctrl-C, running until killed");
            std::future::pending::<()>().await;
        }
    }
}
