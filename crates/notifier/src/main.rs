use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use linkwatch_common::config::AppConfig;
use linkwatch_common::redis_pool::create_redis_pool;
use linkwatch_notifier::consumer::UpdateConsumer;
use linkwatch_notifier::dead_letter::{DeadLetterMonitor, DeadLetterRouter};
use linkwatch_notifier::recipient::{LogRecipient, Recipient, TelegramRecipient};
use linkwatch_notifier::stream::{ConsumerGroup, RedisStream};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "linkwatch_notifier=info".into()),
        )
        .json()
        .init();

    tracing::info!("Linkwatch notifier starting...");

    let config = AppConfig::from_env()?;

    let recipient: Arc<dyn Recipient> =
        match (&config.telegram_bot_token, &config.telegram_chat_id) {
            (Some(token), Some(chat_id)) => {
                let client = reqwest::Client::builder()
                    .timeout(config.http_timeout)
                    .build()?;
                tracing::info!(chat_id = %chat_id, "Forwarding updates to Telegram");
                Arc::new(TelegramRecipient::new(client, token, chat_id))
            }
            _ => {
                tracing::warn!("TELEGRAM_BOT_TOKEN/TELEGRAM_CHAT_ID not set, logging updates only");
                Arc::new(LogRecipient)
            }
        };

    // Blocking reads hold their connection, so each loop gets its own.
    let updates_conn = create_redis_pool(&config.redis_url).await?;
    let dlq_read_conn = create_redis_pool(&config.redis_url).await?;
    let dlq_write_conn = create_redis_pool(&config.redis_url).await?;

    let updates = RedisStream::consumer(
        updates_conn,
        &config.updates_topic,
        ConsumerGroup {
            group: config.consumer_group.clone(),
            consumer: config.consumer_name.clone(),
        },
    )
    .await?;
    let dead_letters = RedisStream::consumer(
        dlq_read_conn,
        &config.dlq_topic,
        ConsumerGroup {
            group: config.dlq_consumer_group.clone(),
            consumer: config.consumer_name.clone(),
        },
    )
    .await?;
    let dlq_publisher = RedisStream::publisher(dlq_write_conn, &config.dlq_topic);

    let consumer = UpdateConsumer::new(
        Arc::new(updates),
        recipient,
        DeadLetterRouter::new(Arc::new(dlq_publisher)),
    );
    let monitor = DeadLetterMonitor::new(Arc::new(dead_letters));

    let shutdown = CancellationToken::new();
    let consumer_task = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { consumer.run(shutdown).await }
    });
    let monitor_task = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { monitor.run(shutdown).await }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal, stopping gracefully...");
    shutdown.cancel();

    // In-flight messages finish before the loops exit.
    let (consumer_result, monitor_result) = tokio::join!(consumer_task, monitor_task);
    if let Err(e) = consumer_result {
        tracing::error!(error = %e, "Update consumer task failed");
    }
    if let Err(e) = monitor_result {
        tracing::error!(error = %e, "Dead-letter monitor task failed");
    }

    tracing::info!("Linkwatch notifier stopped.");
    Ok(())
}
