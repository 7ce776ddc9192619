use std::net::SocketAddr;
use std::sync::Arc;

use prometheus::Registry;

use tokio_util::sync::CancellationToken;

use linkwatch_checker::ResourceChangeChecker;
use linkwatch_checker::github::GitHubClient;
use linkwatch_checker::stackoverflow::StackOverflowClient;
use linkwatch_common::config::AppConfig;
use linkwatch_common::db;
use linkwatch_common::redis_pool::create_redis_pool;
use linkwatch_common::types::TransportKind;
use linkwatch_notifier::breaker::BreakerConfig;
use linkwatch_notifier::dead_letter::DeadLetterRouter;
use linkwatch_notifier::dispatcher::NotificationDispatcher;
use linkwatch_notifier::metrics::DeliveryMetrics;
use linkwatch_notifier::retry::RetryPolicy;
use linkwatch_notifier::stream::RedisStream;
use linkwatch_notifier::transport::{HttpTransport, QueueTransport, Transport};
use linkwatch_poller::metrics_server;
use linkwatch_poller::poller::Poller;
use linkwatch_poller::store::PgSubscriptionStore;

const USER_AGENT: &str = concat!("linkwatch/", env!("CARGO_PKG_VERSION"));

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "linkwatch_poller=info,linkwatch_checker=info,linkwatch_notifier=info".into()
            }),
        )
        .json()
        .init();

    let config = AppConfig::from_env()?;

    let pool = db::create_pool(config.require_database_url()?, config.db_max_connections).await?;
    db::run_migrations(&pool).await?;

    let store = PgSubscriptionStore::new(pool);

    // `linkwatch-poller track <url>...` registers resources and exits.
    let args: Vec<String> = std::env::args().skip(1).collect();
    if let Some((command, urls)) = args.split_first() {
        anyhow::ensure!(command == "track", "unknown command '{}'", command);
        for url in urls {
            let resource = store.track(url).await?;
            tracing::info!(
                resource_id = %resource.id,
                url = %resource.url,
                kind = %resource.kind,
                "Tracking resource"
            );
        }
        return Ok(());
    }

    tracing::info!("Linkwatch poller starting...");

    let client = reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(config.http_timeout)
        .build()?;
    let checker = ResourceChangeChecker::new()
        .with_source(Arc::new(StackOverflowClient::new(
            client.clone(),
            config.stackoverflow_api_key.clone(),
        )))
        .with_source(Arc::new(GitHubClient::new(
            client,
            config.github_token.clone(),
        )));

    // Publishers never block, so they share one connection.
    let redis = create_redis_pool(&config.redis_url).await?;
    let http: Arc<dyn Transport> = Arc::new(HttpTransport::new(
        config.updates_endpoint(),
        config.http_timeout,
    )?);
    let queue: Arc<dyn Transport> = Arc::new(QueueTransport::new(Arc::new(
        RedisStream::publisher(redis.clone(), &config.updates_topic),
    )));
    let (primary, secondary) = match config.primary_transport {
        TransportKind::Http => (http, queue),
        TransportKind::Queue => (queue, http),
    };

    let registry = Registry::new();
    let dispatcher = NotificationDispatcher::new(
        primary,
        secondary,
        RetryPolicy::new(config.retries, config.backoff_base),
        BreakerConfig {
            fail_threshold: config.breaker_fail_threshold,
            reset_timeout: config.breaker_reset_timeout,
        },
        DeliveryMetrics::new(&registry)?,
    );
    tracing::info!(
        primary = %dispatcher.primary_kind(),
        secondary = %dispatcher.secondary_kind(),
        "Notification dispatcher ready"
    );

    let poller = Poller::new(
        Arc::new(store),
        checker,
        Arc::new(dispatcher),
        config.batch_size,
        config.check_interval,
    )
    .with_dead_letters(DeadLetterRouter::new(Arc::new(RedisStream::publisher(
        redis,
        &config.dlq_topic,
    ))));

    let shutdown = CancellationToken::new();
    let metrics_task = tokio::spawn(metrics_server::serve(
        SocketAddr::from(([0, 0, 0, 0], config.metrics_port)),
        registry,
        shutdown.clone(),
    ));
    let task = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { poller.run(shutdown).await }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal, stopping gracefully...");
    shutdown.cancel();

    let (poller_result, metrics_result) = tokio::join!(task, metrics_task);
    if let Err(e) = poller_result {
        tracing::error!(error = %e, "Poller task failed");
    }
    match metrics_result {
        Ok(Err(e)) => tracing::error!(error = %e, "Metrics server failed"),
        Err(e) => tracing::error!(error = %e, "Metrics server task failed"),
        Ok(Ok(())) => {}
    }

    tracing::info!("Linkwatch poller stopped.");
    Ok(())
}
