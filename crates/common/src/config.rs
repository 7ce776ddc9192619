use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::types::TransportKind;

/// Global application configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// PostgreSQL connection string. Only the poller needs it.
    pub database_url: Option<String>,

    /// Maximum number of PostgreSQL connections in the pool (default: 20)
    pub db_max_connections: u32,

    /// Redis connection string
    pub redis_url: String,

    /// Pause between two poll cycles (default: 60s)
    pub check_interval: Duration,

    /// Number of tracked resources fetched per page (default: 500)
    pub batch_size: u32,

    /// Transport tried first; the other one is the fallback (default: http)
    pub primary_transport: TransportKind,

    /// Base URL of the service receiving HTTP notifications
    pub server_url: String,

    /// Per-request timeout for outbound HTTP calls (default: 3s)
    pub http_timeout: Duration,

    /// Maximum attempts per transport send, first try included (default: 3)
    pub retries: u32,

    /// Linear backoff unit between attempts (default: 300ms)
    pub backoff_base: Duration,

    /// Consecutive failures that trip a transport's breaker (default: 3, minimum 1)
    pub breaker_fail_threshold: u32,

    /// Time an open breaker waits before admitting a trial call (default: 30s)
    pub breaker_reset_timeout: Duration,

    /// Stream carrying change events on the queue transport
    pub updates_topic: String,

    /// Stream holding dead-lettered events
    pub dlq_topic: String,

    /// Consumer group reading `updates_topic`
    pub consumer_group: String,

    /// Consumer group reading `dlq_topic`
    pub dlq_consumer_group: String,

    /// Consumer name within the groups
    pub consumer_name: String,

    /// GitHub API token (raises the rate limit)
    pub github_token: Option<String>,

    /// Stack Exchange API key (raises the quota)
    pub stackoverflow_api_key: Option<String>,

    /// Telegram bot token used to forward rendered notifications
    pub telegram_bot_token: Option<String>,

    /// Telegram chat receiving the notifications
    pub telegram_chat_id: Option<String>,

    /// Port serving Prometheus metrics (default: 8001)
    pub metrics_port: u16,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            database_url: std::env::var("DATABASE_URL").ok(),
            db_max_connections: parse_var("DB_MAX_CONNECTIONS", "20")?,
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            check_interval: Duration::from_secs(parse_var("CHECK_UPDATE_INTERVAL", "60")?),
            batch_size: parse_var("BATCH_SIZE", "500")?,
            primary_transport: std::env::var("MESSAGE_TRANSPORT")
                .unwrap_or_else(|_| "http".to_string())
                .parse()
                .map_err(|e| anyhow::anyhow!("MESSAGE_TRANSPORT: {}", e))?,
            server_url: std::env::var("SERVER_URL")
                .unwrap_or_else(|_| "http://localhost:8000".to_string()),
            http_timeout: parse_seconds("HTTP_TIMEOUT", "3.0")?,
            retries: parse_var::<u32>("RETRIES", "3")?.max(1),
            backoff_base: parse_seconds("BACKOFF_FACTOR", "0.3")?,
            breaker_fail_threshold: parse_var::<u32>("BREAKER_FAIL_THRESHOLD", "3")?.max(1),
            breaker_reset_timeout: Duration::from_secs(parse_var(
                "BREAKER_RESET_TIMEOUT_SECS",
                "30",
            )?),
            updates_topic: std::env::var("UPDATES_TOPIC")
                .unwrap_or_else(|_| "link_updates".to_string()),
            dlq_topic: std::env::var("DLQ_TOPIC")
                .unwrap_or_else(|_| "dead-letter-topic".to_string()),
            consumer_group: std::env::var("CONSUMER_GROUP")
                .unwrap_or_else(|_| "server-group".to_string()),
            dlq_consumer_group: std::env::var("DLQ_CONSUMER_GROUP")
                .unwrap_or_else(|_| "server-dlq-group".to_string()),
            consumer_name: std::env::var("CONSUMER_NAME")
                .unwrap_or_else(|_| "linkwatch-1".to_string()),
            github_token: std::env::var("GITHUB_TOKEN").ok(),
            stackoverflow_api_key: std::env::var("STACKOVERFLOW_API_KEY").ok(),
            telegram_bot_token: std::env::var("TELEGRAM_BOT_TOKEN").ok(),
            telegram_chat_id: std::env::var("TELEGRAM_CHAT_ID").ok(),
            metrics_port: parse_var("METRICS_PORT", "8001")?,
        })
    }

    /// Database URL for components that persist state.
    pub fn require_database_url(&self) -> anyhow::Result<&str> {
        self.database_url
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("DATABASE_URL environment variable is required"))
    }

    /// Endpoint receiving HTTP notifications.
    pub fn updates_endpoint(&self) -> String {
        format!("{}/api/v1/updated/", self.server_url.trim_end_matches('/'))
    }
}

fn parse_var<T: FromStr>(key: &str, default: &str) -> anyhow::Result<T> {
    let raw = std::env::var(key).unwrap_or_else(|_| default.to_string());
    raw.trim().parse().map_err(|_| {
        anyhow::anyhow!(
            "{} must be a valid {}",
            key,
            std::any::type_name::<T>()
        )
    })
}

fn parse_seconds(key: &str, default: &str) -> anyhow::Result<Duration> {
    let secs: f64 = parse_var(key, default)?;
    Duration::try_from_secs_f64(secs)
        .map_err(|_| anyhow::anyhow!("{} must be a non-negative number of seconds", key))
}
