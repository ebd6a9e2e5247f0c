//! hmq-events-publish: publish one event from the command line.
//!
//! Usage: `hmq-events-publish <event-name> '<json>'`
//!
//! ## Configuration
//! - HMQ_EVENTS__BROKER__URL: AMQP URL (default: amqp://localhost:5672)
//! - HMQ_EVENTS__EVENTS__NAMESPACE: event namespace (required)
//! - HMQ_EVENTS_LOG: log filter (default: info)

use std::sync::Arc;

use serde_json::Value;
use tracing::info;

use hmq_events::broker::{AmqpConnection, BrokerConnection};
use hmq_events::config::Config;
use hmq_events::utils::bootstrap::{connect_with_retry, init_tracing};

const USAGE: &str = "usage: hmq-events-publish <event-name> <json>";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let mut args = std::env::args().skip(1);
    let (Some(event), Some(body)) = (args.next(), args.next()) else {
        return Err(USAGE.into());
    };
    let content: Value = serde_json::from_str(&body)?;

    let config = Config::load(None)?;
    let mut publisher = config.events.publisher()?;

    let url = config.broker.url.clone();
    let connection = Arc::new(
        connect_with_retry(&url, config.broker.connect_retries, || {
            AmqpConnection::connect(&url)
        })
        .await?,
    );
    publisher.connect(connection.clone()).await?;

    publisher.publish(&event, &content).await?;
    info!(exchange = %publisher.exchange(), event = %event, "Published");

    publisher.close().await?;
    connection.close().await?;
    Ok(())
}
