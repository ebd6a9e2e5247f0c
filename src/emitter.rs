//! Local subscription table.
//!
//! Maps event names to the ordered list of listeners registered on a
//! consumer. Raising an event calls each listener synchronously, in
//! registration order.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use serde_json::Value;

/// Callback invoked with the decoded payload of an event.
pub type Listener = Arc<dyn Fn(&Value) + Send + Sync>;

/// Event name to listeners.
///
/// Cloning shares the underlying table.
#[derive(Clone, Default)]
pub struct SubscriptionTable {
    listeners: Arc<RwLock<HashMap<String, Vec<Listener>>>>,
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener for `event`.
    pub fn on<F>(&self, event: impl Into<String>, listener: F)
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let mut guard = self
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        guard
            .entry(event.into())
            .or_default()
            .push(Arc::new(listener));
    }

    /// Call every listener of `event` with `payload`.
    ///
    /// Returns the number of listeners invoked. A panicking listener
    /// propagates and the remaining listeners are skipped.
    pub fn raise(&self, event: &str, payload: &Value) -> usize {
        // Snapshot so listeners may register further listeners.
        let listeners: Vec<Listener> = {
            let guard = self
                .listeners
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            guard.get(event).cloned().unwrap_or_default()
        };

        for listener in &listeners {
            listener(payload);
        }
        listeners.len()
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(event)
            .map_or(0, Vec::len)
    }

    /// Drop every listener.
    pub fn clear(&self) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl std::fmt::Debug for SubscriptionTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let guard = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let counts: HashMap<&str, usize> =
            guard.iter().map(|(k, v)| (k.as_str(), v.len())).collect();
        f.debug_struct("SubscriptionTable")
            .field("listeners", &counts)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    #[test]
    fn test_raise_in_registration_order() {
        let table = SubscriptionTable::new();
        let calls = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let calls = calls.clone();
            table.on("event", move |_| calls.lock().unwrap().push(i));
        }

        assert_eq!(table.raise("event", &json!({})), 3);
        assert_eq!(*calls.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_raise_passes_payload() {
        let table = SubscriptionTable::new();
        let seen = Arc::new(Mutex::new(None));
        let seen_clone = seen.clone();
        table.on("event", move |payload| {
            *seen_clone.lock().unwrap() = Some(payload.clone());
        });

        table.raise("event", &json!({"property": "value"}));
        assert_eq!(
            seen.lock().unwrap().clone(),
            Some(json!({"property": "value"}))
        );
    }

    #[test]
    fn test_raise_unknown_event() {
        let table = SubscriptionTable::new();
        table.on("event-1", |_| panic!("wrong event"));
        assert_eq!(table.raise("event-2", &json!(null)), 0);
    }

    #[test]
    fn test_listener_may_register_listener() {
        let table = SubscriptionTable::new();
        let inner = table.clone();
        table.on("event", move |_| inner.on("other", |_| {}));

        table.raise("event", &json!(1));
        assert_eq!(table.listener_count("other"), 1);
    }

    #[test]
    fn test_clear() {
        let table = SubscriptionTable::new();
        table.on("event", |_| {});
        table.clear();
        assert_eq!(table.listener_count("event"), 0);
    }
}
