mod cache;
mod catalog;
mod config;
mod downloader;
mod downloads;
mod error;
mod library;
mod logging;
mod paginator;
mod paths;
mod record;
mod server;
mod utils;
mod youtube;

#[cfg(test)]
mod test_support;

use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;

use cache::{spawn_refresh_loop, Clock, SystemClock};
use catalog::{Catalog, Feed, YoutubeCatalog};
use config::GatewayConfig;
use downloader::Downloader;
use downloads::InflightRegistry;
use library::LocalLibrary;
use logging::GatewayLogger;
use paths::PathConfig;
use server::{feed_cache, AppState};
use youtube::YtDlp;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = GatewayConfig::from_env();

    // Initialize gateway directories
    let paths = PathConfig::new(&config.root);
    paths
        .ensure_directories_exist()
        .context("creating gateway directories")?;

    if let Err(e) = GatewayLogger::init(
        paths.logs.gateway_logs.clone(),
        paths.logs.gateway_errors.clone(),
    ) {
        eprintln!("Failed to initialize file logging: {}", e);
    }
    if let Ok(layout) = paths.to_json() {
        log_debug!("Path layout: {}", layout);
    }

    let ytdlp = YtDlp::new(config.ytdlp_path.as_deref(), &config.root, &config.cookie_file);
    log_info!("Using yt-dlp at {}", ytdlp.exe().display());

    let catalog: Arc<dyn Catalog> = Arc::new(
        YoutubeCatalog::new(
            ytdlp.clone(),
            config.youtube_api_key.clone(),
            config.youtube_channel_id.clone(),
        )
        .context("building catalog client")?,
    );
    if config.youtube_api_key.is_none() {
        log_warn!("YOUTUBE_API_KEY not set; item lookups fall back to yt-dlp and playlists are unavailable");
    }

    // Both feed caches start empty and are filled by their refresh loops
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let home = feed_cache(Arc::clone(&catalog), Feed::Home, config.cache_validity, Arc::clone(&clock));
    let subscriptions = feed_cache(
        Arc::clone(&catalog),
        Feed::Subscriptions,
        config.cache_validity,
        clock,
    );
    spawn_refresh_loop(Arc::clone(&home), config.cache_refresh);
    spawn_refresh_loop(Arc::clone(&subscriptions), config.cache_refresh);

    let downloader = Downloader::new(
        Arc::clone(&catalog),
        Arc::new(ytdlp),
        paths.clone(),
        Arc::new(InflightRegistry::new()),
        config.live_backlog,
    )
    .context("building downloader")?;

    let state = AppState {
        catalog,
        home,
        subscriptions,
        downloader: Arc::new(downloader),
        library: Arc::new(LocalLibrary::new(paths.clone())),
        paths: Arc::new(paths),
    };

    let addr = SocketAddr::new(config.host, config.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    log_info!("Server running on http://{}", addr);

    axum::serve(listener, server::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running gateway server")?;

    log_info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = signal::ctrl_c().await {
        log_error!("Failed to install Ctrl+C handler: {}", e);
    }
}
