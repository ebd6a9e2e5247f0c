//! In-memory broker.
//!
//! Models the parts of an AMQP broker this library relies on: topic
//! exchanges, exclusive and auto-deleting queues, round-robin delivery to
//! competing consumers, manual acknowledgment with requeue, and
//! dead-lettering. Useful for tests and single-process deployments.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info};

use super::{
    Acknowledger, BrokerChannel, BrokerConnection, Delivery, DeliveryStream, ExchangeOptions,
    QueueOptions,
};
use crate::envelope::Envelope;
use crate::error::{EventsError, Result};


/// Check if a routing key matches a topic binding pattern.
///
/// Matching rules (words are separated by `.`):
/// - `*` matches exactly one word
/// - `#` matches zero or more words
/// - anything else matches the identical word
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    words_match(&pattern, &key)
}

fn words_match(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| words_match(rest, &key[skip..])),
        Some((&"*", rest)) => !key.is_empty() && words_match(rest, &key[1..]),
        Some((word, rest)) => key.first() == Some(word) && words_match(rest, &key[1..]),
    }
}

// ============================================================================
// Broker state
// ============================================================================

#[derive(Clone)]
struct Message {
    envelope: Envelope,
    redelivered: bool,
}

struct Exchange {
    durable: bool,
    /// (queue, routing key)
    bindings: Vec<(String, String)>,
}

struct QueueConsumer {
    tag: String,
    channel: u64,
    sender: mpsc::UnboundedSender<Result<Delivery>>,
}

struct Unacked {
    message: Message,
    channel: u64,
}

struct Queue {
    options: QueueOptions,
    owner: u64,
    consumers: Vec<QueueConsumer>,
    had_consumer: bool,
    cursor: usize,
    ready: VecDeque<Message>,
    unacked: HashMap<u64, Unacked>,
    next_tag: u64,
}

impl Queue {
    fn new(options: QueueOptions, owner: u64) -> Self {
        Self {
            options,
            owner,
            consumers: Vec::new(),
            had_consumer: false,
            cursor: 0,
            ready: VecDeque::new(),
            unacked: HashMap::new(),
            next_tag: 1,
        }
    }

    fn locked_for(&self, connection: u64) -> bool {
        self.options.exclusive && self.owner != connection
    }
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, Exchange>,
    queues: HashMap<String, Queue>,
    /// channel id -> connection id
    channels: HashMap<u64, u64>,
    closed_connections: HashSet<u64>,
    discarded: u64,
}

impl BrokerState {
    fn delete_queue(&mut self, name: &str) {
        if self.queues.remove(name).is_some() {
            for exchange in self.exchanges.values_mut() {
                exchange.bindings.retain(|(queue, _)| queue != name);
            }
            debug!(queue = %name, "Deleted queue");
        }
    }

    fn delete_if_unused(&mut self, name: &str) {
        let unused = self
            .queues
            .get(name)
            .is_some_and(|q| q.options.auto_delete && q.had_consumer && q.consumers.is_empty());
        if unused {
            self.delete_queue(name);
        }
    }

    /// Queue names matched by `routing_key` on `exchange`.
    fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>> {
        let exchange = self.exchanges.get(exchange).ok_or_else(|| {
            EventsError::Broker(format!("NOT_FOUND - no exchange '{}'", exchange))
        })?;

        let mut matched: Vec<String> = Vec::new();
        for (queue, pattern) in &exchange.bindings {
            if topic_matches(pattern, routing_key) && !matched.contains(queue) {
                matched.push(queue.clone());
            }
        }
        Ok(matched)
    }
}

struct Shared {
    state: Mutex<BrokerState>,
    next_id: AtomicU64,
    weak: Weak<Shared>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn enqueue(&self, state: &mut BrokerState, queue: &str, message: Message, front: bool) {
        if let Some(q) = state.queues.get_mut(queue) {
            if front {
                q.ready.push_front(message);
            } else {
                q.ready.push_back(message);
            }
        }
        self.dispatch(state, queue);
    }

    /// Route an envelope through `exchange` into every matching queue.
    fn publish(&self, state: &mut BrokerState, exchange: &str, envelope: Envelope) -> Result<usize> {
        let queues = state.route(exchange, &envelope.routing_key)?;
        for queue in &queues {
            let message = Message {
                envelope: envelope.clone(),
                redelivered: false,
            };
            self.enqueue(state, queue, message, false);
        }
        Ok(queues.len())
    }

    /// Hand ready messages to consumers, round-robin.
    fn dispatch(&self, state: &mut BrokerState, queue_name: &str) {
        let Some(queue) = state.queues.get_mut(queue_name) else {
            return;
        };

        while !queue.consumers.is_empty() {
            let Some(message) = queue.ready.pop_front() else {
                break;
            };

            let index = queue.cursor % queue.consumers.len();
            let tag = queue.next_tag;
            queue.next_tag += 1;

            let consumer = &queue.consumers[index];
            let delivery = Delivery::new(
                message.envelope.clone(),
                message.redelivered,
                Box::new(MemoryAcker {
                    shared: self.weak.clone(),
                    queue: queue_name.to_string(),
                    tag,
                }),
            );

            if consumer.sender.send(Ok(delivery)).is_ok() {
                queue.unacked.insert(
                    tag,
                    Unacked {
                        message,
                        channel: consumer.channel,
                    },
                );
                queue.cursor = index + 1;
            } else {
                // Receiver gone; drop the consumer and retry the message.
                queue.consumers.remove(index);
                queue.ready.push_front(message);
            }
        }
    }

    fn settle(&self, queue_name: &str, tag: u64, outcome: Settle) -> Result<()> {
        let mut state = self.lock();

        let queue = state
            .queues
            .get_mut(queue_name)
            .ok_or_else(|| EventsError::Broker(format!("NOT_FOUND - no queue '{}'", queue_name)))?;

        let unacked = queue.unacked.remove(&tag).ok_or_else(|| {
            EventsError::Broker(format!("PRECONDITION_FAILED - unknown delivery tag {}", tag))
        })?;

        match outcome {
            Settle::Ack => {}
            Settle::Reject { requeue: true } => {
                let message = Message {
                    redelivered: true,
                    ..unacked.message
                };
                self.enqueue(&mut state, queue_name, message, true);
            }
            Settle::Reject { requeue: false } => {
                let dead_letter = queue.options.dead_letter_exchange.clone();
                let routed = match dead_letter {
                    Some(exchange) => self
                        .publish(&mut state, &exchange, unacked.message.envelope)
                        .unwrap_or(0),
                    None => 0,
                };
                if routed == 0 {
                    state.discarded += 1;
                }
            }
        }
        Ok(())
    }

    fn cancel_consumer(&self, queue_name: &str, channel: u64, tag: &str) {
        let mut state = self.lock();
        if let Some(queue) = state.queues.get_mut(queue_name) {
            queue
                .consumers
                .retain(|c| !(c.channel == channel && c.tag == tag));
        }
        state.delete_if_unused(queue_name);
    }

    fn close_channel(&self, state: &mut BrokerState, channel: u64) {
        if state.channels.remove(&channel).is_none() {
            return;
        }

        let names: Vec<String> = state.queues.keys().cloned().collect();
        for name in &names {
            if let Some(queue) = state.queues.get_mut(name) {
                queue.consumers.retain(|c| c.channel != channel);

                let tags: Vec<u64> = queue
                    .unacked
                    .iter()
                    .filter(|(_, u)| u.channel == channel)
                    .map(|(tag, _)| *tag)
                    .collect();
                let mut requeued: Vec<(u64, Message)> = tags
                    .into_iter()
                    .filter_map(|tag| queue.unacked.remove(&tag).map(|u| (tag, u.message)))
                    .collect();
                requeued.sort_by_key(|(tag, _)| *tag);
                for (_, message) in requeued.into_iter().rev() {
                    queue.ready.push_front(Message {
                        redelivered: true,
                        ..message
                    });
                }
            }
            state.delete_if_unused(name);
            self.dispatch(state, name);
        }
    }

    fn close_connection(&self, connection: u64) {
        let mut state = self.lock();
        if !state.closed_connections.insert(connection) {
            return;
        }

        let channels: Vec<u64> = state
            .channels
            .iter()
            .filter(|(_, conn)| **conn == connection)
            .map(|(channel, _)| *channel)
            .collect();
        for channel in channels {
            self.close_channel(&mut state, channel);
        }

        let exclusive: Vec<String> = state
            .queues
            .iter()
            .filter(|(_, q)| q.options.exclusive && q.owner == connection)
            .map(|(name, _)| name.clone())
            .collect();
        for name in exclusive {
            state.delete_queue(&name);
        }
    }
}

enum Settle {
    Ack,
    Reject { requeue: bool },
}

struct MemoryAcker {
    shared: Weak<Shared>,
    queue: String,
    tag: u64,
}

impl MemoryAcker {
    fn settle(&self, outcome: Settle) -> Result<()> {
        let shared = self
            .shared
            .upgrade()
            .ok_or_else(|| EventsError::Broker("broker shut down".to_string()))?;
        shared.settle(&self.queue, self.tag, outcome)
    }
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        self.settle(Settle::Ack)
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        self.settle(Settle::Reject { requeue })
    }
}

/// Removes the consumer from its queue when the delivery stream is dropped.
struct ConsumerGuard {
    shared: Weak<Shared>,
    queue: String,
    channel: u64,
    tag: String,
}

impl Drop for ConsumerGuard {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.cancel_consumer(&self.queue, self.channel, &self.tag);
        }
    }
}

// ============================================================================
// Public handles
// ============================================================================

/// In-process broker. Cloning shares the same broker.
#[derive(Clone)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        let shared = Arc::new_cyclic(|weak| Shared {
            state: Mutex::new(BrokerState::default()),
            next_id: AtomicU64::new(1),
            weak: weak.clone(),
        });
        info!("In-memory broker initialized");
        Self { shared }
    }

    /// Open a new connection.
    pub fn connect(&self) -> Arc<InMemoryConnection> {
        Arc::new(InMemoryConnection {
            shared: self.shared.clone(),
            id: self.shared.next_id(),
        })
    }

    pub fn exchange_exists(&self, name: &str) -> bool {
        self.shared.lock().exchanges.contains_key(name)
    }

    pub fn queue_exists(&self, name: &str) -> bool {
        self.shared.lock().queues.contains_key(name)
    }

    /// All queue names, sorted.
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.shared.lock().queues.keys().cloned().collect();
        names.sort();
        names
    }

    /// (queue, routing key) pairs bound to `exchange`.
    pub fn bindings(&self, exchange: &str) -> Vec<(String, String)> {
        self.shared
            .lock()
            .exchanges
            .get(exchange)
            .map(|e| e.bindings.clone())
            .unwrap_or_default()
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.shared
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.consumers.len())
    }

    /// Messages waiting for a consumer.
    pub fn ready_count(&self, queue: &str) -> usize {
        self.shared
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.ready.len())
    }

    /// Messages delivered but not yet settled.
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.shared
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.unacked.len())
    }

    /// Channels currently open across all connections.
    pub fn open_channels(&self) -> usize {
        self.shared.lock().channels.len()
    }

    /// Messages rejected without requeue and not dead-lettered anywhere.
    pub fn discarded_count(&self) -> u64 {
        self.shared.lock().discarded
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

/// Connection to an [`InMemoryBroker`].
pub struct InMemoryConnection {
    shared: Arc<Shared>,
    id: u64,
}

impl InMemoryConnection {
    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed_connections.contains(&self.id)
    }
}

#[async_trait]
impl BrokerConnection for InMemoryConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        let mut state = self.shared.lock();
        if state.closed_connections.contains(&self.id) {
            return Err(EventsError::Broker("connection closed".to_string()));
        }

        let id = self.shared.next_id();
        state.channels.insert(id, self.id);
        Ok(Arc::new(InMemoryChannel {
            shared: self.shared.clone(),
            id,
            connection: self.id,
        }))
    }

    async fn close(&self) -> Result<()> {
        self.shared.close_connection(self.id);
        Ok(())
    }
}

/// Channel on an [`InMemoryConnection`].
pub struct InMemoryChannel {
    shared: Arc<Shared>,
    id: u64,
    connection: u64,
}

impl InMemoryChannel {
    fn open_state(&self) -> Result<MutexGuard<'_, BrokerState>> {
        let state = self.shared.lock();
        if !state.channels.contains_key(&self.id) {
            return Err(EventsError::Broker("channel closed".to_string()));
        }
        Ok(state)
    }
}

fn resource_locked(queue: &str) -> EventsError {
    EventsError::Broker(format!(
        "RESOURCE_LOCKED - cannot obtain exclusive access to locked queue '{}'",
        queue
    ))
}

#[async_trait]
impl BrokerChannel for InMemoryChannel {
    async fn declare_topic_exchange(&self, name: &str, options: ExchangeOptions) -> Result<()> {
        let mut state = self.open_state()?;
        match state.exchanges.get(name) {
            Some(existing) if existing.durable != options.durable => {
                Err(EventsError::Broker(format!(
                    "PRECONDITION_FAILED - inequivalent arg 'durable' for exchange '{}'",
                    name
                )))
            }
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(
                    name.to_string(),
                    Exchange {
                        durable: options.durable,
                        bindings: Vec::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<()> {
        let mut state = self.open_state()?;
        match state.queues.get(name) {
            Some(existing) if existing.locked_for(self.connection) => Err(resource_locked(name)),
            Some(existing) if existing.options != options => Err(EventsError::Broker(format!(
                "PRECONDITION_FAILED - inequivalent args for queue '{}'",
                name
            ))),
            Some(_) => Ok(()),
            None => {
                state
                    .queues
                    .insert(name.to_string(), Queue::new(options, self.connection));
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        let mut state = self.open_state()?;
        match state.queues.get(queue) {
            None => {
                return Err(EventsError::Broker(format!(
                    "NOT_FOUND - no queue '{}'",
                    queue
                )))
            }
            Some(q) if q.locked_for(self.connection) => return Err(resource_locked(queue)),
            Some(_) => {}
        }

        let exchange = state.exchanges.get_mut(exchange).ok_or_else(|| {
            EventsError::Broker(format!("NOT_FOUND - no exchange '{}'", exchange))
        })?;

        let binding = (queue.to_string(), routing_key.to_string());
        if !exchange.bindings.contains(&binding) {
            exchange.bindings.push(binding);
        }
        Ok(())
    }

    async fn publish(&self, exchange: &str, envelope: Envelope) -> Result<()> {
        let mut state = self.open_state()?;
        let routing_key = envelope.routing_key.clone();
        let routed = self.shared.publish(&mut state, exchange, envelope)?;
        debug!(
            exchange = %exchange,
            routing_key = %routing_key,
            queues = routed,
            "Routed message"
        );
        Ok(())
    }

    async fn consume(&self, queue_name: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let mut state = self.open_state()?;

        let (sender, receiver) = mpsc::unbounded_channel();
        {
            let queue = state.queues.get_mut(queue_name).ok_or_else(|| {
                EventsError::Broker(format!("NOT_FOUND - no queue '{}'", queue_name))
            })?;
            if queue.locked_for(self.connection) {
                return Err(resource_locked(queue_name));
            }
            queue.consumers.push(QueueConsumer {
                tag: consumer_tag.to_string(),
                channel: self.id,
                sender,
            });
            queue.had_consumer = true;
        }
        self.shared.dispatch(&mut state, queue_name);

        let guard = ConsumerGuard {
            shared: Arc::downgrade(&self.shared),
            queue: queue_name.to_string(),
            channel: self.id,
            tag: consumer_tag.to_string(),
        };
        let stream = UnboundedReceiverStream::new(receiver).map(move |item| {
            let _held = &guard;
            item
        });
        Ok(Box::pin(stream))
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.shared.lock();
        self.shared.close_channel(&mut state, self.id);
        Ok(())
    }
}
