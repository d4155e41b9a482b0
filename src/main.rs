// src/main.rs

//! Upbit listing poller CLI.
//!
//! Bootstraps the selected fetcher, fans the title stream out through a
//! broadcast, and keeps the listing monitor on one follower until Ctrl-C.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use upbit_poller::config::load_config;
use upbit_poller::error::Result;
use upbit_poller::fetchers::{
    AnnouncementByIdFetcher, AnnouncementsFetcher, NewsMonitor, NoticeByIdFetcher,
};
use upbit_poller::logging;
use upbit_poller::models::{Config, NewsTitle};
use upbit_poller::services::geo::{IpInfoResolver, LocationResolver, StaticResolver};
use upbit_poller::services::metrics::{Metrics, RecorderMetrics};
use upbit_poller::services::notifier::{LogNotifier, Notifier};
use upbit_poller::utils::broadcast::broadcast_adapter;

#[derive(Parser, Debug)]
#[command(
    name = "upbit-poller",
    version,
    about = "Proxy-rotating poller for new Upbit listings"
)]
struct Cli {
    #[arg(short, long, default_value = "configs/local.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Poll for new titles and monitor them for listings
    Watch {
        #[arg(long, value_enum, default_value_t = FetcherKind::NoticeById)]
        fetcher: FetcherKind,
    },
    /// Validate the configuration and exit
    Validate,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum FetcherKind {
    /// HTML notice pages probed by ID
    NoticeById,
    /// JSON announcements probed by ID
    AnnouncementById,
    /// First page of the announcements list
    Announcements,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    logging::init(&config.logger);

    match cli.command {
        Command::Validate => {
            info!(
                proxies = config.proxy_rotating_poller.proxies.len(),
                target_rps = config.proxy_rotating_poller.target_rps,
                "configuration is valid"
            );
            Ok(())
        }
        Command::Watch { fetcher } => run_watch(&config, fetcher).await,
    }
}

async fn run_watch(config: &Config, kind: FetcherKind) -> Result<()> {
    let notifier: Arc<dyn Notifier> = Arc::new(LogNotifier);
    let metrics: Arc<dyn Metrics> = Arc::new(RecorderMetrics);
    let resolver = build_resolver(config);

    let token = CancellationToken::new();

    let titles = stream_titles(config, kind, &notifier, &metrics, resolver, &token).await?;
    let broadcast = broadcast_adapter(titles);

    let follower = broadcast.follow().await?;
    let monitor_notifier = Arc::clone(&notifier);
    let monitor_token = token.clone();
    let monitor = tokio::spawn(async move {
        NewsMonitor::new(monitor_notifier)
            .run(follower, monitor_token)
            .await;
    });

    info!("polling started, Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    info!("shutting down");
    token.cancel();
    if let Err(e) = monitor.await {
        error!(error = %e, "monitor task failed");
    }
    broadcast.close().await;

    Ok(())
}

async fn stream_titles(
    config: &Config,
    kind: FetcherKind,
    notifier: &Arc<dyn Notifier>,
    metrics: &Arc<dyn Metrics>,
    resolver: Box<dyn LocationResolver>,
    token: &CancellationToken,
) -> Result<tokio::sync::mpsc::Receiver<NewsTitle>> {
    match kind {
        FetcherKind::NoticeById => {
            let fetcher = NoticeByIdFetcher::new(
                config,
                Arc::clone(notifier),
                Arc::clone(metrics),
                resolver,
            )
            .await?;
            fetcher.stream_new_titles(token.clone())
        }
        FetcherKind::AnnouncementById => {
            let fetcher = AnnouncementByIdFetcher::new(
                config,
                Arc::clone(notifier),
                Arc::clone(metrics),
                resolver,
            )
            .await?;
            fetcher.stream_new_titles(token.clone()).await
        }
        FetcherKind::Announcements => {
            let fetcher = AnnouncementsFetcher::new(
                config,
                Arc::clone(notifier),
                Arc::clone(metrics),
                resolver,
            )
            .await?;
            fetcher.stream_new_titles(token.clone())
        }
    }
}

fn build_resolver(config: &Config) -> Box<dyn LocationResolver> {
    match &config.ipinfo_token {
        Some(ipinfo_token) => match IpInfoResolver::new(ipinfo_token.as_str()) {
            Ok(resolver) => return Box::new(resolver),
            Err(e) => error!(error = %e, "falling back to static location resolver"),
        },
        None => info!("no ipinfo token configured, all proxies share one location group"),
    }

    Box::new(StaticResolver::empty())
}
