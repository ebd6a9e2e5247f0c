//! Exchange and queue naming.
//!
//! Names are derived purely from the namespace, the event name and the
//! application identity, so a process restarted with the same identity
//! binds to the same queues again.

/// Suffix appended to a namespace to form its exchange name.
pub const EXCHANGE_SUFFIX: &str = "-events-exchange";

/// Separator between event name and application identity in queue names.
pub const QUEUE_INFIX: &str = "-events-queue-";

/// Exchange shared by every publisher and consumer of `namespace`.
pub fn exchange_name(namespace: &str) -> String {
    format!("{}{}", namespace, EXCHANGE_SUFFIX)
}

/// Queue private to one application instance for one event name.
///
/// Distinct `app_id`s yield distinct queues (broadcast); a shared `app_id`
/// yields a shared queue (competing consumers).
pub fn queue_name(event_name: &str, app_id: &str) -> String {
    format!("{}{}{}", event_name, QUEUE_INFIX, app_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exchange_name() {
        assert_eq!(exchange_name("test-events"), "test-events-events-exchange");
    }

    #[test]
    fn test_queue_name() {
        assert_eq!(
            queue_name("user-created", "billing"),
            "user-created-events-queue-billing"
        );
    }

    #[test]
    fn test_queue_name_is_stable() {
        assert_eq!(queue_name("e", "app"), queue_name("e", "app"));
        assert_ne!(queue_name("e", "app-1"), queue_name("e", "app-2"));
    }
}
