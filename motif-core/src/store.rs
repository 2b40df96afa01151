//! Observable per-step state.
//!
//! A store is owned by exactly one step instance. Listeners are notified
//! synchronously after every change, outside of any internal borrow, so a
//! listener may read the store again.

use serde_json::Value;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

type Listener = Rc<dyn Fn()>;

struct StoreInner {
    state: RefCell<Value>,
    listeners: RefCell<Vec<(u64, Listener)>>,
    next_listener: Cell<u64>,
}

/// Mutable, observable state cell.
#[derive(Clone)]
pub struct Store {
    inner: Rc<StoreInner>,
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("state", &*self.inner.state.borrow())
            .field("listeners", &self.inner.listeners.borrow().len())
            .finish()
    }
}

impl Store {
    pub fn new(initial: Value) -> Self {
        Self {
            inner: Rc::new(StoreInner {
                state: RefCell::new(initial),
                listeners: RefCell::new(Vec::new()),
                next_listener: Cell::new(0),
            }),
        }
    }

    /// Returns a copy of the current state.
    pub fn get(&self) -> Value {
        self.inner.state.borrow().clone()
    }

    /// Replaces the state. Listeners run only if the value changed.
    pub fn set(&self, value: Value) {
        let changed = {
            let mut state = self.inner.state.borrow_mut();
            if *state == value {
                false
            } else {
                *state = value;
                true
            }
        };
        if changed {
            self.notify();
        }
    }

    /// Mutates the state in place.
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut Value),
    {
        let mut next = self.get();
        f(&mut next);
        self.set(next);
    }

    /// Shallow-merges the keys of `patch` into an object state.
    ///
    /// A non-object state or patch replaces the state outright.
    pub fn merge(&self, patch: Value) {
        let merged = merge_shallow(&self.get(), patch);
        self.set(merged);
    }

    /// Registers a change listener.
    pub fn subscribe<F>(&self, listener: F) -> StoreSubscription
    where
        F: Fn() + 'static,
    {
        let id = self.inner.next_listener.get();
        self.inner.next_listener.set(id + 1);
        self.inner
            .listeners
            .borrow_mut()
            .push((id, Rc::new(listener)));
        StoreSubscription {
            store: Rc::downgrade(&self.inner),
            id,
        }
    }

    /// Returns the number of attached listeners.
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.borrow().len()
    }

    fn notify(&self) {
        let listeners: Vec<Listener> = self
            .inner
            .listeners
            .borrow()
            .iter()
            .map(|(_, l)| Rc::clone(l))
            .collect();
        for listener in listeners {
            listener();
        }
    }
}

/// Handle returned by [`Store::subscribe`].
#[derive(Debug)]
pub struct StoreSubscription {
    store: Weak<StoreInner>,
    id: u64,
}

impl StoreSubscription {
    /// Detaches the listener. Detaching twice or after the store is gone is a no-op.
    pub fn unsubscribe(self) {
        if let Some(inner) = self.store.upgrade() {
            inner.listeners.borrow_mut().retain(|(id, _)| *id != self.id);
        }
    }
}

fn merge_shallow(state: &Value, patch: Value) -> Value {
    match (state, patch) {
        (Value::Object(state_map), Value::Object(patch_map)) => {
            let mut result = state_map.clone();
            for (k, v) in patch_map {
                result.insert(k, v);
            }
            Value::Object(result)
        }
        (_, patch) => patch,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_get_set() {
        let store = Store::new(json!({"count": 0}));
        store.set(json!({"count": 1}));
        assert_eq!(store.get(), json!({"count": 1}));
    }

    #[test]
    fn test_notifies_on_change_only() {
        let store = Store::new(json!(0));
        let hits = Rc::new(Cell::new(0));
        let h = hits.clone();
        let _sub = store.subscribe(move || h.set(h.get() + 1));

        store.set(json!(1));
        store.set(json!(1));
        store.update(|v| *v = json!(2));

        assert_eq!(hits.get(), 2);
    }

    #[test]
    fn test_unsubscribe() {
        let store = Store::new(json!(0));
        let hits = Rc::new(Cell::new(0));
        let h = hits.clone();
        let sub = store.subscribe(move || h.set(h.get() + 1));
        assert_eq!(store.listener_count(), 1);

        sub.unsubscribe();
        store.set(json!(5));

        assert_eq!(hits.get(), 0);
        assert_eq!(store.listener_count(), 0);
    }

    #[test]
    fn test_listener_may_read_store() {
        let store = Store::new(json!(0));
        let seen = Rc::new(RefCell::new(Vec::new()));
        let (s, seen2) = (store.clone(), seen.clone());
        let _sub = store.subscribe(move || seen2.borrow_mut().push(s.get()));

        store.set(json!(7));

        assert_eq!(*seen.borrow(), vec![json!(7)]);
    }

    #[test]
    fn test_merge() {
        let store = Store::new(json!({"a": 1, "b": 2}));
        store.merge(json!({"b": 3, "c": 4}));
        assert_eq!(store.get(), json!({"a": 1, "b": 3, "c": 4}));

        store.merge(json!(9));
        assert_eq!(store.get(), json!(9));
    }
}
