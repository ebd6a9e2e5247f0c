//! Broker topology for publishers and consumers.
//!
//! Publishers only need the namespace exchange. Consumers additionally get
//! one exclusive, auto-deleting queue per subscribed event name, bound to
//! the exchange with the event name as exact routing key.

use futures::future::{try_join_all, BoxFuture};
use tracing::info;

use crate::broker::{BrokerChannel, ExchangeOptions, QueueOptions};
use crate::error::{EventsError, Result};
use crate::naming::{exchange_name, queue_name};

/// Queue assigned to one subscribed event name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventBinding {
    pub event_name: String,
    pub queue_name: String,
}

impl EventBinding {
    pub fn new(event_name: &str, app_id: &str) -> Self {
        Self {
            event_name: event_name.to_string(),
            queue_name: queue_name(event_name, app_id),
        }
    }
}

/// Validate an event list and derive its bindings.
///
/// Duplicate names collapse to their first occurrence so that each event
/// name owns exactly one queue.
pub fn event_bindings<S: AsRef<str>>(events: &[S], app_id: &str) -> Result<Vec<EventBinding>> {
    if events.is_empty() {
        return Err(EventsError::required("events"));
    }

    let mut bindings: Vec<EventBinding> = Vec::with_capacity(events.len());
    for event in events {
        let event = event.as_ref();
        if event.is_empty() {
            return Err(EventsError::malformed("events"));
        }
        if !bindings.iter().any(|b| b.event_name == event) {
            bindings.push(EventBinding::new(event, app_id));
        }
    }
    Ok(bindings)
}

fn require_namespace(namespace: &str) -> Result<()> {
    if namespace.is_empty() {
        return Err(EventsError::required("name"));
    }
    Ok(())
}

/// Declare the namespace exchange. Returns the exchange name.
pub async fn setup_publisher(
    channel: &dyn BrokerChannel,
    namespace: &str,
    exchange_options: ExchangeOptions,
) -> Result<String> {
    require_namespace(namespace)?;

    let exchange = exchange_name(namespace);
    channel
        .declare_topic_exchange(&exchange, exchange_options)
        .await?;

    info!(exchange = %exchange, "Publisher topology ready");
    Ok(exchange)
}

/// Declare the exchange plus one bound queue per event name.
///
/// All declarations and bindings are issued together and awaited as a
/// single join; the first failure fails the whole setup.
pub async fn setup_consumer<S: AsRef<str>>(
    channel: &dyn BrokerChannel,
    namespace: &str,
    app_id: &str,
    events: &[S],
    exchange_options: ExchangeOptions,
    queue_options: QueueOptions,
) -> Result<Vec<EventBinding>> {
    require_namespace(namespace)?;
    if app_id.is_empty() {
        return Err(EventsError::required("appId"));
    }
    let bindings = event_bindings(events, app_id)?;
    let exchange = exchange_name(namespace);

    let mut operations: Vec<BoxFuture<'_, Result<()>>> = Vec::with_capacity(1 + 2 * bindings.len());
    operations.push(channel.declare_topic_exchange(&exchange, exchange_options));
    for binding in &bindings {
        operations.push(channel.declare_queue(&binding.queue_name, queue_options.clone()));
        operations.push(channel.bind_queue(&binding.queue_name, &exchange, &binding.event_name));
    }

    try_join_all(operations).await?;

    for binding in &bindings {
        info!(
            exchange = %exchange,
            queue = %binding.queue_name,
            routing_key = %binding.event_name,
            "Bound queue to exchange"
        );
    }
    Ok(bindings)
}
