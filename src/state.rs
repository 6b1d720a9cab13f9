//! Single-slot published state with synchronous broadcast to listeners.

use crate::protocol::ListenerId;
use serde_json::Value;
use std::collections::BTreeMap;

pub type StateListener = Box<dyn Fn(&Value) + Send + Sync>;

/// Value owned by one context, replaced wholesale on every change.
///
/// Listener ids increase monotonically and are never reused; listeners are
/// notified in registration order.
pub struct PublishedState {
    value: Value,
    listeners: BTreeMap<ListenerId, StateListener>,
    last_listener_id: ListenerId,
}

impl PublishedState {
    pub fn new() -> Self {
        Self {
            value: Value::Object(Default::default()),
            listeners: BTreeMap::new(),
            last_listener_id: 0,
        }
    }

    pub fn get(&self) -> &Value {
        &self.value
    }

    /// Replace the value and notify every current listener.
    pub fn set(&mut self, value: Value) {
        self.value = value;
        for listener in self.listeners.values() {
            listener(&self.value);
        }
    }

    /// Compute the next value from the previous one, then `set` it.
    pub fn update<F>(&mut self, next: F)
    where
        F: FnOnce(&Value) -> Value,
    {
        let value = next(&self.value);
        self.set(value);
    }

    pub fn add_listener(&mut self, listener: StateListener) -> ListenerId {
        self.last_listener_id += 1;
        self.listeners.insert(self.last_listener_id, listener);
        self.last_listener_id
    }

    /// Returns `false` when no listener had this id.
    pub fn remove_listener(&mut self, listener_id: ListenerId) -> bool {
        self.listeners.remove(&listener_id).is_some()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Drop every listener; used when the owning context goes away.
    pub fn clear_listeners(&mut self) {
        self.listeners.clear();
    }
}

impl Default for PublishedState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    fn recorder() -> (StateListener, Arc<Mutex<Vec<Value>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (Box::new(move |v: &Value| sink.lock().unwrap().push(v.clone())), seen)
    }

    #[test]
    fn test_initial_state_is_empty_object() {
        assert_eq!(PublishedState::new().get(), &json!({}));
    }

    #[test]
    fn test_set_notifies_in_order() {
        let mut state = PublishedState::new();
        let (listener, seen) = recorder();
        state.add_listener(listener);

        state.set(json!({"n": 1}));
        state.set(json!({"n": 2}));

        assert_eq!(*seen.lock().unwrap(), vec![json!({"n": 1}), json!({"n": 2})]);
    }

    #[test]
    fn test_update_sees_previous_value() {
        let mut state = PublishedState::new();
        state.set(json!({"n": 1}));
        state.update(|prev| json!({"n": prev["n"].as_i64().unwrap_or(0) + 1}));
        assert_eq!(state.get(), &json!({"n": 2}));
    }

    #[test]
    fn test_listener_ids_are_never_reused() {
        let mut state = PublishedState::new();
        let first = state.add_listener(Box::new(|_| {}));
        assert!(state.remove_listener(first));
        let second = state.add_listener(Box::new(|_| {}));
        assert!(second > first);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let mut state = PublishedState::new();
        let (listener, seen) = recorder();
        let id = state.add_listener(listener);

        assert!(state.remove_listener(id));
        assert!(!state.remove_listener(id));
        assert!(!state.remove_listener(999));

        state.set(json!(1));
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(state.listener_count(), 0);
    }
}
