//! Event publisher.
//!
//! Publishes JSON events to the namespace exchange with the event name as
//! routing key. Publishers never declare queues; that is the consumers'
//! responsibility.

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::broker::{BrokerSession, ConnectTarget, ExchangeOptions};
use crate::envelope::Envelope;
use crate::error::{EventsError, Result};
use crate::naming::exchange_name;
use crate::topology::setup_publisher;

/// Publishes events into one namespace.
pub struct Publisher {
    namespace: String,
    exchange: String,
    exchange_options: ExchangeOptions,
    session: Option<BrokerSession>,
}

impl Publisher {
    /// Create a publisher for `namespace`. Fails with `InvalidOption` if empty.
    pub fn new(namespace: impl Into<String>) -> Result<Self> {
        let namespace = namespace.into();
        if namespace.is_empty() {
            return Err(EventsError::required("name"));
        }

        Ok(Self {
            exchange: exchange_name(&namespace),
            namespace,
            exchange_options: ExchangeOptions::default(),
            session: None,
        })
    }

    pub fn with_exchange_options(mut self, options: ExchangeOptions) -> Self {
        self.exchange_options = options;
        self
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    /// Open a channel and make sure the namespace exchange exists.
    ///
    /// On failure the channel (and a connection opened from a URI) is
    /// released again.
    pub async fn connect(&mut self, target: impl Into<ConnectTarget>) -> Result<&mut Self> {
        if self.session.is_some() {
            return Ok(self);
        }

        let session = BrokerSession::open(target.into()).await?;
        if let Err(e) =
            setup_publisher(session.channel().as_ref(), &self.namespace, self.exchange_options).await
        {
            if let Err(close_err) = session.close().await {
                warn!(error = %close_err, "Failed to release broker session");
            }
            return Err(e);
        }

        info!(namespace = %self.namespace, exchange = %self.exchange, "Publisher connected");
        self.session = Some(session);
        Ok(self)
    }

    /// Publish `content` as event `routing_key`.
    ///
    /// Completes once the channel accepts the message; delivery to queues
    /// is not awaited.
    pub async fn publish<T>(&self, routing_key: &str, content: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        let envelope = Envelope::json(routing_key, content)?;

        let session = self
            .session
            .as_ref()
            .ok_or_else(|| EventsError::NotConnected("publisher is not connected".to_string()))?;

        session.channel().publish(&self.exchange, envelope).await?;

        debug!(exchange = %self.exchange, routing_key = %routing_key, "Published event");
        Ok(())
    }

    /// Release the channel. Publishing afterwards fails with `NotConnected`.
    pub async fn close(&mut self) -> Result<()> {
        match self.session.take() {
            Some(session) => session.close().await,
            None => Ok(()),
        }
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            session.close_in_background();
        }
    }
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("namespace", &self.namespace)
            .field("exchange", &self.exchange)
            .field("connected", &self.is_connected())
            .finish()
    }
}
