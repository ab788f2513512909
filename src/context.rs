//! Thread-scoped diagnostic properties.
//!
//! Properties set here are visible to every record created on the same thread. They are only
//! meaningful on the producing thread, which is why an asynchronous engine snapshots them into
//! the record (see [`FixFlags::PROPERTIES`](crate::record::FixFlags::PROPERTIES)) before the
//! record is queued.

use std::cell::RefCell;
use std::collections::BTreeMap;

/// Ordered key/value properties attached to a record.
pub type Properties = BTreeMap<String, String>;

thread_local! {
    static PROPERTIES: RefCell<Properties> = RefCell::new(Properties::new());
}

/// Accessors for the current thread's properties.
#[derive(Debug, Clone, Copy)]
pub struct ThreadContext;

impl ThreadContext {
    /// Set `key` on the current thread, returning the previous value.
    pub fn set(key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        PROPERTIES.with(|p| p.borrow_mut().insert(key.into(), value.into()))
    }

    pub fn get(key: &str) -> Option<String> {
        PROPERTIES.with(|p| p.borrow().get(key).cloned())
    }

    pub fn remove(key: &str) -> Option<String> {
        PROPERTIES.with(|p| p.borrow_mut().remove(key))
    }

    pub fn clear() {
        PROPERTIES.with(|p| p.borrow_mut().clear());
    }

    /// Copy of the current thread's properties.
    pub fn snapshot() -> Properties {
        PROPERTIES.with(|p| p.borrow().clone())
    }

    /// Set `key` until the returned guard drops, then restore whatever was there before.
    #[must_use = "the property is removed again when the guard drops"]
    pub fn scoped(key: impl Into<String>, value: impl Into<String>) -> ContextGuard {
        let key = key.into();
        let previous = Self::set(key.clone(), value);
        ContextGuard { key, previous }
    }
}

/// Restores a property on drop. See [`ThreadContext::scoped`].
#[derive(Debug)]
pub struct ContextGuard {
    key: String,
    previous: Option<String>,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        match self.previous.take() {
            Some(prev) => {
                ThreadContext::set(self.key.clone(), prev);
            }
            None => {
                ThreadContext::remove(&self.key);
            }
        }
    }
}
