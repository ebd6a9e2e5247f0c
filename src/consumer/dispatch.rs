//! Per-message processing: validate, decode, raise, acknowledge.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use futures::StreamExt;
use tracing::{debug, error, info, warn};

use crate::broker::{Delivery, DeliveryStream};
use crate::emitter::SubscriptionTable;
use crate::error::{EventsError, Result};

/// What happened to one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatched {
    /// The broker cancelled the subscription; nothing to settle.
    Cancelled,
    /// The event was raised to `listeners` listeners and acknowledged.
    Delivered { listeners: usize },
}

/// Raises inbound events on a subscription table.
#[derive(Clone, Debug)]
pub struct Dispatcher {
    listeners: SubscriptionTable,
}

impl Dispatcher {
    pub fn new(listeners: SubscriptionTable) -> Self {
        Self { listeners }
    }

    /// Handle one message consumed from the queue of `event_name`.
    ///
    /// - `None` means the broker cancelled the consumer: nothing is raised or
    ///   settled.
    /// - A content type other than JSON, or a body that is not valid JSON, is
    ///   rejected without requeue and returned as `UnsupportedContentType` or
    ///   `MalformedMessage`. No listener runs.
    /// - Otherwise the payload is raised to every listener in registration
    ///   order and the message is acknowledged, even when a listener panics.
    ///   A panic is then returned as `ListenerPanicked`.
    pub async fn handle_message(
        &self,
        event_name: &str,
        delivery: Option<Delivery>,
    ) -> Result<Dispatched> {
        let Some(delivery) = delivery else {
            return Ok(Dispatched::Cancelled);
        };

        let payload = match delivery.envelope.decode_json() {
            Ok(payload) => payload,
            Err(e) => {
                if let Err(reject_err) = delivery.reject(false).await {
                    warn!(event = %event_name, error = %reject_err, "Failed to reject message");
                }
                return Err(e);
            }
        };

        debug!(
            event = %event_name,
            redelivered = delivery.redelivered,
            "Received event"
        );

        let raised = panic::catch_unwind(AssertUnwindSafe(|| {
            self.listeners.raise(event_name, &payload)
        }));

        let acked = delivery.ack().await;

        match (raised, acked) {
            (Ok(listeners), Ok(())) => Ok(Dispatched::Delivered { listeners }),
            (Ok(_), Err(e)) => Err(e),
            (Err(panic), acked) => {
                if let Err(e) = acked {
                    warn!(event = %event_name, error = %e, "Failed to ack message after listener panic");
                }
                Err(EventsError::ListenerPanicked {
                    event: event_name.to_string(),
                    message: panic_message(panic.as_ref()),
                })
            }
        }
    }

    /// Consume `stream` until the broker ends it.
    ///
    /// Per-message failures are logged and do not stop the loop.
    pub async fn run(self, event_name: String, queue: String, mut stream: DeliveryStream) {
        info!(event = %event_name, queue = %queue, "Subscribed");

        loop {
            let delivery = match stream.next().await {
                Some(Ok(delivery)) => Some(delivery),
                Some(Err(e)) => {
                    error!(queue = %queue, error = %e, "Delivery stream failed");
                    break;
                }
                None => None,
            };

            match self.handle_message(&event_name, delivery).await {
                Ok(Dispatched::Cancelled) => break,
                Ok(Dispatched::Delivered { .. }) => {}
                Err(e @ EventsError::ListenerPanicked { .. }) => {
                    error!(event = %event_name, error = %e, "Listener failed");
                }
                Err(e) if e.is_message_error() => {
                    warn!(event = %event_name, queue = %queue, error = %e, "Dropped message");
                }
                Err(e) => {
                    error!(event = %event_name, queue = %queue, error = %e, "Failed to settle message");
                }
            }
        }

        info!(event = %event_name, queue = %queue, "Unsubscribed");
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
