//! # Completion Callbacks
//!
//! Purpose: The single callback type every asynchronous cluster-core API
//! accepts.
//!
//! ## Design Principles
//! 1. **Single Use**: `complete` consumes the completion, so a result can be
//!    delivered at most once.
//! 2. **Never Lost**: Dropping an unresolved completion delivers
//!    `Delivery::Abandoned`, so a blocked waiter always wakes up.

use std::fmt;

/// What a completion delivers to its receiver.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery<T> {
    /// The operation finished with a value.
    Resolved(T),
    /// The completion was dropped without a value.
    Abandoned,
}

type Callback<T> = Box<dyn FnOnce(Delivery<T>) + Send + 'static>;

/// One-shot completion handed to an asynchronous operation.
pub struct Completion<T: Send + 'static> {
    callback: Option<Callback<T>>,
}

impl<T: Send + 'static> Completion<T> {
    /// Wraps a receiver callback.
    pub fn new<F>(callback: F) -> Self
    where
        F: FnOnce(Delivery<T>) + Send + 'static,
    {
        Completion {
            callback: Some(Box::new(callback)),
        }
    }

    /// Delivers the operation's result.
    pub fn complete(mut self, value: T) {
        if let Some(callback) = self.callback.take() {
            callback(Delivery::Resolved(value));
        }
    }

    /// Adapts the delivered value.
    ///
    /// Used when a core wraps one of its own completions around a caller's.
    pub fn map<U, F>(self, f: F) -> Completion<U>
    where
        U: Send + 'static,
        F: FnOnce(U) -> T + Send + 'static,
    {
        Completion::new(move |delivery| match delivery {
            Delivery::Resolved(value) => self.complete(f(value)),
            // Dropping `self` delivers `Abandoned` to the outer receiver.
            Delivery::Abandoned => drop(self),
        })
    }
}

impl<T: Send + 'static> Drop for Completion<T> {
    fn drop(&mut self) {
        if let Some(callback) = self.callback.take() {
            callback(Delivery::Abandoned);
        }
    }
}

impl<T: Send + 'static> fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("pending", &self.callback.is_some())
            .finish()
    }
}
