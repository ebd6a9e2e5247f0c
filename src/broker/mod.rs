//! Broker capability consumed by the topology, publisher and consumer.
//!
//! This module contains:
//! - `BrokerConnection` / `BrokerChannel` traits: what the library needs from
//!   a broker client
//! - `Delivery` and `Acknowledger`: an inbound message and its ack handle
//! - `BrokerSession`: scoped ownership of one channel (and its connection
//!   when opened from a URI)
//! - Implementations: AMQP (RabbitMQ via lapin), in-memory

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tracing::{debug, warn};

use crate::envelope::Envelope;
use crate::error::{EventsError, Result};

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod memory;

#[cfg(feature = "amqp")]
pub use amqp::AmqpConnection;
pub use memory::{InMemoryBroker, InMemoryConnection};

// ============================================================================
// Options
// ============================================================================

/// Properties of the namespace exchange. The kind is always topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExchangeOptions {
    pub durable: bool,
}

impl Default for ExchangeOptions {
    fn default() -> Self {
        Self { durable: true }
    }
}

/// Properties of a consumer queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueOptions {
    /// Usable only by the declaring connection.
    pub exclusive: bool,
    pub durable: bool,
    /// Deleted when its last consumer goes away.
    pub auto_delete: bool,
    /// Exchange receiving messages rejected without requeue.
    pub dead_letter_exchange: Option<String>,
}

impl QueueOptions {
    /// Options for per-event consumer queues.
    pub fn event_queue() -> Self {
        Self {
            exclusive: true,
            durable: false,
            auto_delete: true,
            dead_letter_exchange: None,
        }
    }

    pub fn with_dead_letter_exchange(mut self, exchange: Option<String>) -> Self {
        self.dead_letter_exchange = exchange;
        self
    }
}

// ============================================================================
// Deliveries
// ============================================================================

/// Settles one delivery with the broker.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// Positive acknowledgment of this single message.
    async fn ack(&self) -> Result<()>;

    /// Negative acknowledgment of this single message.
    async fn reject(&self, requeue: bool) -> Result<()>;
}

/// An inbound message together with its acknowledgment handle.
pub struct Delivery {
    pub envelope: Envelope,
    pub redelivered: bool,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(envelope: Envelope, redelivered: bool, acker: Box<dyn Acknowledger>) -> Self {
        Self {
            envelope,
            redelivered,
            acker,
        }
    }

    pub async fn ack(&self) -> Result<()> {
        self.acker.ack().await
    }

    pub async fn reject(&self, requeue: bool) -> Result<()> {
        self.acker.reject(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("envelope", &self.envelope)
            .field("redelivered", &self.redelivered)
            .finish_non_exhaustive()
    }
}

/// Deliveries from one queue. The stream ends when the broker cancels
/// the consumer or the channel closes.
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

// ============================================================================
// Traits
// ============================================================================

/// One multiplexed channel on a broker connection.
///
/// A channel is owned by the instance that created it and is not shared
/// between publishers or consumers.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declare a topic exchange. Idempotent for compatible properties.
    async fn declare_topic_exchange(&self, name: &str, options: ExchangeOptions) -> Result<()>;

    /// Declare a queue. Idempotent for compatible properties.
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<()>;

    /// Bind `queue` to `exchange` with an exact routing key.
    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    /// Hand an envelope to the broker. Does not wait for routing confirmation.
    async fn publish(&self, exchange: &str, envelope: Envelope) -> Result<()>;

    /// Start consuming `queue` with manual acknowledgment.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream>;

    async fn close(&self) -> Result<()>;
}

/// A live broker connection able to open channels.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>>;

    async fn close(&self) -> Result<()>;
}

// ============================================================================
// Connection targets and sessions
// ============================================================================

/// What `connect` accepts: an existing connection or a URI to open one.
#[derive(Clone)]
pub enum ConnectTarget {
    Uri(String),
    Connection(Arc<dyn BrokerConnection>),
}

impl fmt::Debug for ConnectTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectTarget::Uri(uri) => f.debug_tuple("Uri").field(uri).finish(),
            ConnectTarget::Connection(_) => f.write_str("Connection(..)"),
        }
    }
}

impl From<&str> for ConnectTarget {
    fn from(uri: &str) -> Self {
        ConnectTarget::Uri(uri.to_string())
    }
}

impl From<String> for ConnectTarget {
    fn from(uri: String) -> Self {
        ConnectTarget::Uri(uri)
    }
}

impl From<&String> for ConnectTarget {
    fn from(uri: &String) -> Self {
        ConnectTarget::Uri(uri.clone())
    }
}

impl From<Arc<dyn BrokerConnection>> for ConnectTarget {
    fn from(connection: Arc<dyn BrokerConnection>) -> Self {
        ConnectTarget::Connection(connection)
    }
}

impl From<Arc<InMemoryConnection>> for ConnectTarget {
    fn from(connection: Arc<InMemoryConnection>) -> Self {
        ConnectTarget::Connection(connection)
    }
}

#[cfg(feature = "amqp")]
impl From<Arc<AmqpConnection>> for ConnectTarget {
    fn from(connection: Arc<AmqpConnection>) -> Self {
        ConnectTarget::Connection(connection)
    }
}

impl ConnectTarget {
    /// Resolve to a connection. The flag is true when the connection was
    /// opened here and must be closed by the caller.
    async fn resolve(self) -> Result<(Arc<dyn BrokerConnection>, bool)> {
        match self {
            ConnectTarget::Connection(connection) => Ok((connection, false)),
            ConnectTarget::Uri(uri) => {
                if uri.trim().is_empty() {
                    return Err(EventsError::required("connectionOrURI"));
                }
                if !is_amqp_uri(&uri) {
                    return Err(EventsError::malformed("connectionOrURI"));
                }
                open_uri(&uri).await.map(|connection| (connection, true))
            }
        }
    }
}

fn is_amqp_uri(uri: &str) -> bool {
    uri.starts_with("amqp://") || uri.starts_with("amqps://")
}

#[cfg(feature = "amqp")]
async fn open_uri(uri: &str) -> Result<Arc<dyn BrokerConnection>> {
    let connection = AmqpConnection::connect(uri).await?;
    Ok(Arc::new(connection))
}

#[cfg(not(feature = "amqp"))]
async fn open_uri(_uri: &str) -> Result<Arc<dyn BrokerConnection>> {
    Err(EventsError::Broker(
        "AMQP support requires the 'amqp' feature. Rebuild with --features amqp".to_string(),
    ))
}

/// One channel owned by a publisher or consumer.
///
/// Closing the session closes the channel, and the connection when the
/// session opened it.
pub struct BrokerSession {
    connection: Arc<dyn BrokerConnection>,
    channel: Arc<dyn BrokerChannel>,
    owns_connection: bool,
}

impl BrokerSession {
    /// Resolve the target and open a channel on it.
    pub async fn open(target: ConnectTarget) -> Result<Self> {
        let (connection, owns_connection) = target.resolve().await?;

        match connection.create_channel().await {
            Ok(channel) => Ok(Self {
                connection,
                channel,
                owns_connection,
            }),
            Err(e) => {
                if owns_connection {
                    if let Err(close_err) = connection.close().await {
                        warn!(error = %close_err, "Failed to close connection");
                    }
                }
                Err(e)
            }
        }
    }

    pub fn channel(&self) -> &Arc<dyn BrokerChannel> {
        &self.channel
    }

    /// Release the channel and, if owned, the connection.
    ///
    /// Both are attempted; the first failure is returned.
    pub async fn close(self) -> Result<()> {
        let channel_result = self.channel.close().await;
        let connection_result = if self.owns_connection {
            self.connection.close().await
        } else {
            Ok(())
        };
        debug!(owns_connection = self.owns_connection, "Broker session closed");
        channel_result.and(connection_result)
    }

    /// Close the session on the current tokio runtime without waiting.
    ///
    /// Used from `Drop`, where the close cannot be awaited. Outside a
    /// runtime the session is leaked and a warning is logged.
    pub fn close_in_background(self) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = self.close().await {
                        warn!(error = %e, "Failed to release broker session");
                    }
                });
            }
            Err(_) => {
                warn!("No tokio runtime to release broker session; channel left open");
            }
        }
    }
}
