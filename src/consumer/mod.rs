//! Event consumer.
//!
//! A consumer subscribes to a set of event names in one namespace and
//! receives every instance of those events, whichever publisher sent them.
//! Each consumer application instance (identified by its app id) gets its
//! own queue per event name, so delivery is broadcast across instances
//! rather than load-balanced between them.

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use futures::future::try_join_all;

use crate::broker::{BrokerSession, ConnectTarget, ExchangeOptions, QueueOptions};
use crate::emitter::SubscriptionTable;
use crate::error::{EventsError, Result};
use crate::identity::{IdentityGenerator, UuidIdentity};
use crate::naming::exchange_name;
use crate::topology::{event_bindings, setup_consumer, EventBinding};

pub mod dispatch;

pub use dispatch::{Dispatched, Dispatcher};

/// Construction options for a [`Consumer`].
#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    /// Event namespace; selects the exchange.
    pub namespace: String,
    /// Event names to subscribe to.
    pub events: Vec<String>,
    /// Application identity. Generated when absent or empty.
    pub app_id: Option<String>,
    pub exchange: ExchangeOptions,
    /// Exchange receiving rejected (malformed) messages.
    pub dead_letter_exchange: Option<String>,
}

impl ConsumerOptions {
    pub fn new<I, S>(namespace: impl Into<String>, events: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            namespace: namespace.into(),
            events: events.into_iter().map(Into::into).collect(),
            app_id: None,
            exchange: ExchangeOptions::default(),
            dead_letter_exchange: None,
        }
    }

    pub fn with_app_id(mut self, app_id: impl Into<String>) -> Self {
        self.app_id = Some(app_id.into());
        self
    }

    pub fn with_exchange_options(mut self, options: ExchangeOptions) -> Self {
        self.exchange = options;
        self
    }

    pub fn with_dead_letter_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.dead_letter_exchange = Some(exchange.into());
        self
    }
}

/// Whether a bound queue is currently being consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Unsubscribed,
    Subscribed,
}

struct Connected {
    session: BrokerSession,
    /// One task per binding, in binding order.
    tasks: Vec<JoinHandle<()>>,
}

impl Connected {
    /// False once every subscription task has ended, e.g. after the
    /// connection was closed underneath the consumer.
    fn is_live(&self) -> bool {
        self.tasks.iter().any(|task| !task.is_finished())
    }

    fn abort(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Receives the events it subscribed to and raises them on local listeners.
pub struct Consumer {
    namespace: String,
    exchange: String,
    app_id: String,
    bindings: Vec<EventBinding>,
    exchange_options: ExchangeOptions,
    queue_options: QueueOptions,
    listeners: SubscriptionTable,
    connected: Option<Connected>,
}

impl Consumer {
    /// Validate options and derive queue bindings.
    ///
    /// A missing app id is replaced by a random UUID.
    pub fn new(options: ConsumerOptions) -> Result<Self> {
        Self::with_identity(options, &UuidIdentity)
    }

    /// Like [`Consumer::new`] with a custom generator for missing app ids.
    pub fn with_identity(options: ConsumerOptions, identity: &dyn IdentityGenerator) -> Result<Self> {
        if options.namespace.is_empty() {
            return Err(EventsError::required("name"));
        }
        if options.events.is_empty() {
            return Err(EventsError::required("events"));
        }

        let app_id = match options.app_id {
            Some(app_id) if !app_id.is_empty() => app_id,
            _ => identity.generate(),
        };
        let bindings = event_bindings(&options.events, &app_id)?;

        Ok(Self {
            exchange: exchange_name(&options.namespace),
            namespace: options.namespace,
            app_id,
            bindings,
            exchange_options: options.exchange,
            queue_options: QueueOptions::event_queue()
                .with_dead_letter_exchange(options.dead_letter_exchange),
            listeners: SubscriptionTable::new(),
            connected: None,
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    pub fn bindings(&self) -> &[EventBinding] {
        &self.bindings
    }

    pub fn event_names(&self) -> impl Iterator<Item = &str> {
        self.bindings.iter().map(|b| b.event_name.as_str())
    }

    /// Register a listener for `event`.
    ///
    /// Listeners run synchronously on the subscription task; hand long work
    /// off (see [`Consumer::subscribe`]) so acknowledgments are not delayed.
    pub fn on<F>(&self, event: impl Into<String>, listener: F)
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.listeners.on(event, listener);
    }

    /// Receive payloads of `event` on a channel.
    pub fn subscribe(&self, event: impl Into<String>) -> mpsc::UnboundedReceiver<Value> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.on(event, move |payload| {
            let _ = tx.send(payload.clone());
        });
        rx
    }

    /// Raise `event` on the local listeners only. Returns the listener count.
    pub fn raise(&self, event: &str, payload: &Value) -> usize {
        self.listeners.raise(event, payload)
    }

    /// True while at least one subscription is still consuming.
    pub fn is_connected(&self) -> bool {
        self.connected.as_ref().is_some_and(Connected::is_live)
    }

    /// State of each binding's subscription, in binding order.
    pub fn subscriptions(&self) -> Vec<(EventBinding, SubscriptionState)> {
        self.bindings
            .iter()
            .enumerate()
            .map(|(i, binding)| {
                let running = self
                    .connected
                    .as_ref()
                    .and_then(|c| c.tasks.get(i))
                    .is_some_and(|task| !task.is_finished());
                let state = if running {
                    SubscriptionState::Subscribed
                } else {
                    SubscriptionState::Unsubscribed
                };
                (binding.clone(), state)
            })
            .collect()
    }

    /// Open a channel, set up exchange, queues and bindings, and start one
    /// subscription task per queue.
    ///
    /// Must be called within a tokio runtime. On failure the channel (and a
    /// connection opened from a URI) is released again. A no-op while
    /// connected; once every subscription has ended, the stale session is
    /// released and the topology is set up again on `target`.
    pub async fn connect(&mut self, target: impl Into<ConnectTarget>) -> Result<&mut Self> {
        if self.is_connected() {
            return Ok(self);
        }
        if let Some(stale) = self.connected.take() {
            warn!(
                namespace = %self.namespace,
                app_id = %self.app_id,
                "All subscriptions ended; reconnecting"
            );
            stale.abort();
            if let Err(e) = stale.session.close().await {
                warn!(error = %e, "Failed to release broker session");
            }
        }

        let session = BrokerSession::open(target.into()).await?;
        match self.start(&session).await {
            Ok(tasks) => {
                info!(
                    namespace = %self.namespace,
                    app_id = %self.app_id,
                    queues = tasks.len(),
                    "Consumer connected"
                );
                self.connected = Some(Connected { session, tasks });
                Ok(self)
            }
            Err(e) => {
                if let Err(close_err) = session.close().await {
                    warn!(error = %close_err, "Failed to release broker session");
                }
                Err(e)
            }
        }
    }

    async fn start(&self, session: &BrokerSession) -> Result<Vec<JoinHandle<()>>> {
        let channel = session.channel();
        let events: Vec<&str> = self.event_names().collect();

        setup_consumer(
            channel.as_ref(),
            &self.namespace,
            &self.app_id,
            &events,
            self.exchange_options,
            self.queue_options.clone(),
        )
        .await?;

        let tags: Vec<String> = self
            .bindings
            .iter()
            .map(|b| format!("{}-consumer", b.queue_name))
            .collect();
        let streams = try_join_all(
            self.bindings
                .iter()
                .zip(&tags)
                .map(|(binding, tag)| channel.consume(&binding.queue_name, tag)),
        )
        .await?;

        let dispatcher = Dispatcher::new(self.listeners.clone());
        let tasks = self
            .bindings
            .iter()
            .zip(streams)
            .map(|(binding, stream)| {
                tokio::spawn(dispatcher.clone().run(
                    binding.event_name.clone(),
                    binding.queue_name.clone(),
                    stream,
                ))
            })
            .collect();
        Ok(tasks)
    }

    /// Stop all subscriptions and release the channel.
    ///
    /// Queues are auto-deleting, so they disappear once their consumer is
    /// gone. Listeners stay registered for a later `connect`.
    pub async fn close(&mut self) -> Result<()> {
        let Some(connected) = self.connected.take() else {
            return Ok(());
        };

        connected.abort();
        connected.session.close().await?;
        info!(namespace = %self.namespace, app_id = %self.app_id, "Consumer closed");
        Ok(())
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        if let Some(connected) = self.connected.take() {
            connected.abort();
            connected.session.close_in_background();
        }
    }
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("namespace", &self.namespace)
            .field("app_id", &self.app_id)
            .field("bindings", &self.bindings)
            .field("connected", &self.is_connected())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerConnection, InMemoryBroker};
    use crate::error::OptionKind;
    use crate::publisher::Publisher;
    use serde_json::json;
    use std::time::Duration;

    fn options() -> ConsumerOptions {
        ConsumerOptions::new("test-events", ["some-event", "some-other-event"])
    }

    #[test]
    fn test_new_requires_namespace() {
        let result = Consumer::new(ConsumerOptions::new("", ["e"]));
        assert!(matches!(
            result,
            Err(EventsError::InvalidOption {
                option: "name",
                kind: OptionKind::Required
            })
        ));
    }

    #[test]
    fn test_new_requires_events() {
        let none: [&str; 0] = [];
        let result = Consumer::new(ConsumerOptions::new("ns", none));
        assert!(matches!(
            result,
            Err(EventsError::InvalidOption {
                option: "events",
                kind: OptionKind::Required
            })
        ));
    }

    #[test]
    fn test_new_derives_bindings() {
        let consumer = Consumer::new(options().with_app_id("app")).unwrap();

        assert_eq!(consumer.exchange(), "test-events-events-exchange");
        assert_eq!(consumer.app_id(), "app");
        let queues: Vec<&str> = consumer
            .bindings()
            .iter()
            .map(|b| b.queue_name.as_str())
            .collect();
        assert_eq!(
            queues,
            vec![
                "some-event-events-queue-app",
                "some-other-event-events-queue-app"
            ]
        );
    }

    #[test]
    fn test_generated_identity() {
        let consumer = Consumer::with_identity(options(), &|| "generated".to_string()).unwrap();
        assert_eq!(consumer.app_id(), "generated");

        let empty = Consumer::with_identity(options().with_app_id(""), &|| "fallback".to_string())
            .unwrap();
        assert_eq!(empty.app_id(), "fallback");
    }

    #[test]
    fn test_default_identities_differ() {
        let a = Consumer::new(options()).unwrap();
        let b = Consumer::new(options()).unwrap();
        assert_ne!(a.app_id(), b.app_id());
    }

    #[test]
    fn test_raise_reaches_local_listeners() {
        let consumer = Consumer::new(options()).unwrap();
        let mut rx = consumer.subscribe("some-event");

        assert_eq!(consumer.raise("some-event", &serde_json::json!(1)), 1);
        assert_eq!(rx.try_recv().unwrap(), serde_json::json!(1));
    }

    #[tokio::test]
    async fn test_connect_and_close_lifecycle() {
        let broker = InMemoryBroker::new();
        let mut consumer = Consumer::new(options().with_app_id("app")).unwrap();
        assert!(consumer
            .subscriptions()
            .iter()
            .all(|(_, state)| *state == SubscriptionState::Unsubscribed));

        consumer.connect(broker.connect()).await.unwrap();
        assert!(consumer.is_connected());
        assert!(consumer
            .subscriptions()
            .iter()
            .all(|(_, state)| *state == SubscriptionState::Subscribed));
        assert_eq!(broker.consumer_count("some-event-events-queue-app"), 1);

        consumer.close().await.unwrap();
        assert!(!consumer.is_connected());
        assert!(consumer
            .subscriptions()
            .iter()
            .all(|(_, state)| *state == SubscriptionState::Unsubscribed));
    }

    #[tokio::test]
    async fn test_connect_twice_is_noop() {
        let broker = InMemoryBroker::new();
        let mut consumer = Consumer::new(options().with_app_id("app")).unwrap();

        consumer.connect(broker.connect()).await.unwrap();
        consumer.connect(broker.connect()).await.unwrap();

        assert_eq!(broker.consumer_count("some-event-events-queue-app"), 1);
    }

    #[tokio::test]
    async fn test_failed_connect_releases_channel() {
        let broker = InMemoryBroker::new();
        let mut first = Consumer::new(options().with_app_id("app")).unwrap();
        first.connect(broker.connect()).await.unwrap();

        let mut second = Consumer::new(options().with_app_id("app")).unwrap();
        let result = second.connect(broker.connect()).await;

        assert!(matches!(result, Err(EventsError::Broker(_))));
        assert!(!second.is_connected());
        assert_eq!(broker.consumer_count("some-event-events-queue-app"), 1);
    }

    #[tokio::test]
    async fn test_drop_requeues_undelivered_jobs() {
        let broker = InMemoryBroker::new();
        let connection = broker.connect();
        let options = ConsumerOptions::new("ns", ["job-queued"]).with_app_id("workers");
        let mut first = Consumer::new(options.clone()).unwrap();
        let mut second = Consumer::new(options).unwrap();
        let mut jobs = second.subscribe("job-queued");
        first.connect(connection.clone()).await.unwrap();
        second.connect(connection.clone()).await.unwrap();

        let mut publisher = Publisher::new("ns").unwrap();
        publisher.connect(connection.clone()).await.unwrap();
        for job in 0..10 {
            publisher
                .publish("job-queued", &json!({ "job": job }))
                .await
                .unwrap();
        }

        // Half the jobs are still sitting unprocessed in `first`'s stream.
        drop(first);

        for _ in 0..10 {
            tokio::time::timeout(Duration::from_secs(1), jobs.recv())
                .await
                .expect("job was not redelivered")
                .unwrap();
        }
        tokio::time::timeout(Duration::from_secs(1), async {
            while broker.unacked_count("job-queued-events-queue-workers") > 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("jobs left unacked");
    }

    #[tokio::test]
    async fn test_reconnect_after_connection_lost() {
        let broker = InMemoryBroker::new();
        let lost = broker.connect();
        let mut consumer = Consumer::new(options().with_app_id("app")).unwrap();
        let mut rx = consumer.subscribe("some-event");
        consumer.connect(lost.clone()).await.unwrap();

        lost.close().await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), async {
            while consumer.is_connected() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("consumer still reports connected");
        assert!(consumer
            .subscriptions()
            .iter()
            .all(|(_, state)| *state == SubscriptionState::Unsubscribed));

        let connection = broker.connect();
        consumer.connect(connection.clone()).await.unwrap();
        assert!(consumer.is_connected());
        assert!(broker.queue_exists("some-event-events-queue-app"));

        let mut publisher = Publisher::new("test-events").unwrap();
        publisher.connect(connection).await.unwrap();
        publisher.publish("some-event", &json!(1)).await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("no event after reconnect");
        assert_eq!(received, Some(json!(1)));
    }
}
