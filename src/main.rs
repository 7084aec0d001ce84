use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use hdhr_bridge::config::Config;
use hdhr_bridge::database::Database;
use hdhr_bridge::epg::{EpgCaches, EpgQuery};
use hdhr_bridge::ingestor::scheduler::SchedulerService;
use hdhr_bridge::ingestor::EpgIngester;
use hdhr_bridge::streaming::session::{spawn_idle_sweep, SessionManager};
use hdhr_bridge::web::{self, AppState};

#[derive(Parser)]
#[command(name = "hdhr-bridge")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "HDHomeRun-compatible tuner and XMLTV EPG bridge for arbitrary IPTV streams")]
#[command(long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Listening IP address
    #[arg(short = 'H', long, value_name = "IP")]
    host: Option<String>,

    /// Listening port
    #[arg(short, long, value_name = "PORT")]
    port: Option<u16>,

    /// Database URL (overrides config file / DB_PATH)
    #[arg(short = 'd', long, value_name = "URL")]
    database_url: Option<String>,

    /// Log level
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_filter = if cli.log_level == "trace" {
        format!("hdhr_bridge={},tower_http=trace", cli.log_level)
    } else {
        format!("hdhr_bridge={}", cli.log_level)
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting HDHomeRun bridge v{}", env!("CARGO_PKG_VERSION"));

    let mut config = Config::load(&cli.config)?;
    info!(config_file = %cli.config, "configuration loaded");

    if let Some(host) = cli.host {
        config.network.host = host;
    }
    if let Some(port) = cli.port {
        config.network.port = port;
    }

    let database_url = match cli.database_url {
        Some(url) => url,
        None => format!("sqlite://{}?mode=rwc", config.paths.database_path.display()),
    };
    info!(database_url, "using database");

    let db = Database::new(&database_url).await?;
    db.migrate().await?;
    info!("database connection established and migrations applied");

    let caches = EpgCaches::new();
    let epg = EpgQuery::new(db.clone(), caches.clone(), config.epg.clone());
    let ingester = Arc::new(EpgIngester::new(db.clone(), config.epg.clone(), caches.clone())?);
    let scheduler = SchedulerService::new(db.clone(), ingester.clone(), config.epg.clone());

    let shutdown = CancellationToken::new();
    scheduler.start(shutdown.clone());
    info!("EPG scheduler started");

    let sessions = SessionManager::new(
        config.streaming.global_concurrency_limit,
        config.streaming.per_channel_concurrency_limit,
        Duration::from_secs(config.streaming.session_idle_timeout_secs),
    );
    spawn_idle_sweep(
        sessions.clone(),
        Duration::from_secs(config.streaming.idle_sweep_interval_secs),
    );

    let http = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(5))
        .build()?;

    let state = AppState {
        db,
        config: config.clone(),
        sessions,
        http,
        epg,
        ingester,
        scheduler,
    };

    let app = web::router(state);
    let addr: SocketAddr = format!("{}:{}", config.network.host, config.network.port).parse()?;
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "listening for HDHomeRun/Plex requests");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            shutdown.cancel();
            info!("shutdown signal received");
        })
        .await?;

    Ok(())
}
