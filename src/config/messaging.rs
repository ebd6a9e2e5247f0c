//! Broker and event subscription configuration types.

use serde::Deserialize;

use crate::broker::ExchangeOptions;
use crate::consumer::ConsumerOptions;
use crate::error::{EventsError, Result};
use crate::publisher::Publisher;

/// Broker connection configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// AMQP connection URL.
    pub url: String,
    /// Connection attempts before giving up (binaries only).
    pub connect_retries: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: "amqp://localhost:5672".to_string(),
            connect_retries: 10,
        }
    }
}

/// Event namespace and subscription configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Event namespace (exchange prefix).
    pub namespace: Option<String>,
    /// Consumer application identity. Random per process when unset.
    pub app_id: Option<String>,
    /// Event names to consume.
    pub subscribe: Vec<String>,
    /// Declare the namespace exchange as durable.
    pub exchange_durable: bool,
    /// Exchange receiving rejected messages.
    pub dead_letter_exchange: Option<String>,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            app_id: None,
            subscribe: Vec::new(),
            exchange_durable: true,
            dead_letter_exchange: None,
        }
    }
}

impl EventsConfig {
    fn namespace(&self) -> Result<&str> {
        self.namespace
            .as_deref()
            .filter(|ns| !ns.is_empty())
            .ok_or_else(|| EventsError::required("name"))
    }

    fn exchange_options(&self) -> ExchangeOptions {
        ExchangeOptions {
            durable: self.exchange_durable,
        }
    }

    /// Build an unconnected publisher.
    pub fn publisher(&self) -> Result<Publisher> {
        Ok(Publisher::new(self.namespace()?)?.with_exchange_options(self.exchange_options()))
    }

    /// Build consumer options for the configured subscriptions.
    pub fn consumer_options(&self) -> Result<ConsumerOptions> {
        if self.subscribe.is_empty() {
            return Err(EventsError::required("events"));
        }

        let mut options = ConsumerOptions::new(self.namespace()?, self.subscribe.iter().cloned())
            .with_exchange_options(self.exchange_options());
        if let Some(app_id) = &self.app_id {
            options = options.with_app_id(app_id.clone());
        }
        if let Some(exchange) = &self.dead_letter_exchange {
            options = options.with_dead_letter_exchange(exchange.clone());
        }
        Ok(options)
    }
}
