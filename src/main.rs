use anyhow::Result;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use window_throttler::config::Settings;
use window_throttler::server::Server;
use window_throttler::store::{MemoryStore, RedisStore, SWEEP_INTERVAL};
use window_throttler::RateLimiter;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    let settings = Settings::from_env();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("window_throttler={},tower_http=debug", settings.log_level).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let window = settings
        .window_config()
        .map_err(|e| anyhow::anyhow!("Invalid rate limit configuration: {}", e))?;

    tracing::info!("Starting window-throttler");
    tracing::info!(
        "Configuration: bind_addr={}, redis_url={}, limiter={}",
        settings.bind_addr,
        settings.redis_url,
        window
    );

    let server = if settings.uses_redis() {
        let store = RedisStore::connect(&settings.redis_url)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to connect to Redis: {}", e))?;
        let limiter = Arc::new(RateLimiter::new(store, window));
        limiter
            .preload()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to load window script: {}", e))?;
        Server::new(limiter, settings.bind_addr)?
    } else {
        tracing::warn!("REDIS_URL is empty, rate limit state is local to this process");
        let store = Arc::new(MemoryStore::new());
        store.spawn_purger(SWEEP_INTERVAL);
        let limiter = Arc::new(RateLimiter::new(store, window));
        Server::new(limiter, settings.bind_addr)?
    };

    server
        .run()
        .await
        .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

    Ok(())
}
