//! Spiderhost
//!
//! Runs the proxy relay, or calls one contract of a configured spider and
//! prints the answer.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use spiderhost::{HostConfig, SiteConfig, SpiderRegistry};
use spiderhost_js_runtime::{Spider, SpiderHandle};

/// Content-provider script host
#[derive(Parser, Debug)]
#[command(name = "spiderhost")]
#[command(about = "Content-provider script host", long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "./spiderhost.toml")]
    config: PathBuf,

    /// Log as JSON lines
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the proxy relay and preload configured sites
    Serve,

    /// Print a site's home content
    Home {
        site: String,
        /// Ask for filter definitions
        #[arg(long)]
        filter: bool,
    },

    /// Print one category page
    Category {
        site: String,
        tid: String,
        #[arg(long, default_value = "1")]
        page: String,
    },

    /// Print the detail of one item
    Detail { site: String, id: String },

    /// Search a site
    Search {
        site: String,
        keyword: String,
        #[arg(long)]
        quick: bool,
    },

    /// Resolve a play address
    Play { site: String, flag: String, id: String },
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?
        .block_on(async_main(args))
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,spiderhost=debug"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

async fn async_main(args: Args) -> Result<()> {
    let config = HostConfig::load(&args.config)
        .with_context(|| format!("Failed to load configuration from {}", args.config.display()))?;
    let registry = Arc::new(SpiderRegistry::from_config(&config).context("Failed to build spider registry")?);

    match args.command {
        Command::Serve => serve(config, registry).await,
        command => {
            let result = run_contract(&config, &registry, command).await;
            registry.destroy_all().await;
            result
        }
    }
}

async fn serve(config: HostConfig, registry: Arc<SpiderRegistry>) -> Result<()> {
    info!("Starting spiderhost v{}", env!("CARGO_PKG_VERSION"));

    for site in &config.sites {
        let spider = open_site(&registry, site).await;
        if registry.get(spider.key()).is_none() {
            warn!(spider = %site.key, "site failed to load");
        }
    }
    info!(live = registry.len(), configured = config.sites.len(), "sites preloaded");

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("Invalid server address")?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    spiderhost::server::serve(listener, registry, shutdown_signal()).await?;

    info!("Server shutdown complete");
    Ok(())
}

async fn run_contract(config: &HostConfig, registry: &SpiderRegistry, command: Command) -> Result<()> {
    let site_key = match &command {
        Command::Home { site, .. }
        | Command::Category { site, .. }
        | Command::Detail { site, .. }
        | Command::Search { site, .. }
        | Command::Play { site, .. } => site,
        Command::Serve => return Ok(()),
    };
    let site = config
        .site(site_key)
        .with_context(|| format!("No site named {:?} in configuration", site_key))?;
    let spider = open_site(registry, site).await;

    let answer = match command {
        Command::Home { filter, .. } => spider.home_content(filter).await,
        Command::Category { tid, page, .. } => spider.category_content(&tid, &page, false, &HashMap::new()).await,
        Command::Detail { id, .. } => spider.detail_content(&[id]).await,
        Command::Search { keyword, quick, .. } => spider.search_content(&keyword, quick, None).await,
        Command::Play { flag, id, .. } => spider.player_content(&flag, &id, &[]).await,
        Command::Serve => None,
    };

    match answer {
        Some(answer) => println!("{}", answer),
        None => anyhow::bail!("Site {:?} returned no content", site.key),
    }
    Ok(())
}

async fn open_site(registry: &SpiderRegistry, site: &SiteConfig) -> SpiderHandle {
    registry
        .get_spider(
            &site.key,
            &site.api,
            site.ext.as_deref().unwrap_or_default(),
            site.jar.as_deref().unwrap_or_default(),
        )
        .await
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down...");
        },
    }
}
