//! hmq-events-tail: log every configured event as it arrives.
//!
//! Subscribes to `events.subscribe` in `events.namespace` and prints each
//! event payload through tracing until interrupted.
//!
//! ## Configuration
//! - HMQ_EVENTS__BROKER__URL: AMQP URL (default: amqp://localhost:5672)
//! - HMQ_EVENTS__EVENTS__NAMESPACE: event namespace (required)
//! - HMQ_EVENTS__EVENTS__SUBSCRIBE: comma-separated event names (required)
//! - HMQ_EVENTS__EVENTS__APP_ID: fixed queue identity (default: random per run).
//!   Queues are exclusive to this process, so a second tail with the same
//!   identity fails to start with RESOURCE_LOCKED.
//! - HMQ_EVENTS_LOG: log filter (default: info)

use std::sync::Arc;

use tracing::info;

use hmq_events::broker::AmqpConnection;
use hmq_events::config::Config;
use hmq_events::utils::bootstrap::{connect_with_retry, init_tracing};
use hmq_events::Consumer;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = Config::load(None)?;
    let consumer_options = config.events.consumer_options()?;
    let mut consumer = Consumer::new(consumer_options)?;

    let events: Vec<String> = consumer.event_names().map(str::to_string).collect();
    for event in events {
        let name = event.clone();
        consumer.on(event, move |payload| {
            info!(event = %name, payload = %payload, "Event");
        });
    }

    let url = config.broker.url.clone();
    let connection = connect_with_retry(&url, config.broker.connect_retries, || {
        AmqpConnection::connect(&url)
    })
    .await?;
    consumer.connect(Arc::new(connection)).await?;

    info!(
        namespace = %consumer.namespace(),
        app_id = %consumer.app_id(),
        "hmq-events-tail started"
    );

    tokio::signal::ctrl_c().await?;

    consumer.close().await?;
    Ok(())
}
