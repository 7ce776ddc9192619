use anyhow::Context;
use redis::aio::ConnectionManager;

/// Connect to Redis for stream publishing and consuming.
///
/// The manager reconnects transparently and is cheap to clone. Publishers can
/// share one; a loop issuing blocking stream reads needs its own.
pub async fn create_redis_pool(redis_url: &str) -> anyhow::Result<ConnectionManager> {
    let client = redis::Client::open(redis_url).context("REDIS_URL is not a valid Redis URL")?;
    let manager = ConnectionManager::new(client)
        .await
        .context("failed to connect to Redis")?;

    tracing::info!("Connected to Redis");
    Ok(manager)
}
