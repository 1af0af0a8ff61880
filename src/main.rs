use anyhow::{bail, Context};
use dotenv::dotenv;
use log::{info, warn};
use lyrisync::{
    Config, GeminiEngine, HttpPositionSource, LrclibProvider, SongService, SyncBroadcaster,
};
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    info!("Starting lyrisync server...");
    let config = Config::from_env();

    let Some(port) = config.resolve_port() else {
        bail!(
            "no available ports between {} and {}",
            config.port_range.0,
            config.port_range.1
        );
    };

    let api_key = config
        .gemini_api_key
        .clone()
        .context("GEMINI_API_KEY environment variable is required; check your .env file")?;
    let mut engine = GeminiEngine::new(api_key);
    if let Some(model) = &config.gemini_model {
        engine = engine.with_model(model);
    }

    let service = Arc::new(SongService::new(
        LrclibProvider,
        engine,
        config.cache.clone(),
    ));

    let source = HttpPositionSource::new(&config.player_api_url);
    let mut broadcaster = SyncBroadcaster::new(config.broadcast.clone(), source);

    // Warm lyrics for whatever just started playing so clients do not wait
    // on the lookup after the track change reaches them.
    let tracker = Arc::new(HttpPositionSource::new(&config.player_api_url));
    {
        let service = Arc::clone(&service);
        broadcaster.set_track_callback(move |track_id| {
            let service = Arc::clone(&service);
            let tracker = Arc::clone(&tracker);
            let track_id = track_id.to_string();
            tokio::spawn(async move {
                match tracker.current_track().await {
                    Ok(Some(track)) if track.id == track_id => service.prefetch(&track).await,
                    Ok(_) => {}
                    Err(e) => warn!("Could not resolve track metadata: {}", e),
                }
            });
        });
    }

    let shutdown = broadcaster.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received, draining sessions");
            shutdown.cancel();
        }
    });

    let addr = format!("{}:{}", config.host, port);
    info!("Starting server on {}", addr);
    broadcaster.run(&addr).await?;
    info!("Server stopped");
    Ok(())
}
