//! hmq-events - broadcast events over a topic-routed message broker
//!
//! A [`Publisher`] announces named events into a namespace. A [`Consumer`]
//! subscribes to a subset of event names in that namespace and receives
//! every instance of them. Each consumer application instance owns one
//! queue per event name, so delivery fans out to all instances instead of
//! being load-balanced between them.

pub mod broker;
pub mod config;
pub mod consumer;
pub mod emitter;
pub mod envelope;
pub mod error;
pub mod identity;
pub mod naming;
pub mod publisher;
pub mod topology;
pub mod utils;

pub use broker::{ConnectTarget, ExchangeOptions, InMemoryBroker, QueueOptions};
pub use consumer::{Consumer, ConsumerOptions, SubscriptionState};
pub use error::{EventsError, OptionKind, Result};
pub use publisher::Publisher;
pub use topology::EventBinding;
