use clap::Parser;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use m3u_hub::checker::{FfmpegCapture, StreamChecker};
use m3u_hub::config::Config;
use m3u_hub::database::Database;
use m3u_hub::epg::EpgCache;
use m3u_hub::ingestor::scheduler::SchedulerService;
use m3u_hub::ingestor::{HttpPlaylistFetcher, RefreshService};
use m3u_hub::web::{create_router, AppState};

#[derive(Parser)]
#[command(name = "m3u-hub")]
#[command(about = "IPTV playlist aggregation and freshness engine")]
struct Cli {
    /// Host address to bind to
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on
    #[arg(long, short)]
    port: Option<u16>,

    /// Database URL override
    #[arg(long)]
    database_url: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("m3u_hub={},tower_http=warn", cli.log_level).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = Config::load()?;
    if let Some(host) = cli.host {
        config.web.host = host;
    }
    if let Some(port) = cli.port {
        config.web.port = port;
    }
    if let Some(database_url) = cli.database_url {
        config.database.url = database_url;
    }

    info!("Starting m3u-hub");

    let database = Database::new(&config.database).await?;
    database.migrate().await?;

    let refresh = RefreshService::new(Arc::new(HttpPlaylistFetcher::new()));
    let epg_cache = Arc::new(EpgCache::new(config.storage.epg_cache_path.clone()));
    let checker = Arc::new(StreamChecker::new(Arc::new(FfmpegCapture::new(
        config.checker.ffmpeg_command.clone(),
        config.checker.probe_timeout_seconds,
    ))));

    let scheduler = SchedulerService::new(
        database.clone(),
        refresh.clone(),
        epg_cache.clone(),
        checker.clone(),
        config.scheduler.tick_interval_seconds,
        config.checker.scheduler_concurrency,
    );
    tokio::spawn(scheduler.run());

    let bind_address = format!("{}:{}", config.web.host, config.web.port);
    let state = AppState {
        database,
        config: Arc::new(config),
        epg_cache,
        checker,
        refresh,
    };
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    info!("Web server listening on {}", bind_address);
    axum::serve(listener, app).await?;

    Ok(())
}
