//! Lifecycle event callbacks for one submission.
//!
//! Callbacks are bound before the item is enqueued and invoked from the
//! scheduler thread that drains the item's queue, so they must be
//! `Send + Sync`. An item recovered from storage after a restart has no
//! callbacks bound; its events are simply not observed.

use std::sync::Mutex;
use std::time::Duration;

use tracing::warn;

use super::{Status, TransportError};
use crate::vdata::Value;

/// Terminal outcome reported to `on_complete`.
#[derive(Debug, Clone)]
pub enum Outcome {
    Success(Value),
    Failure(TransportError),
}

type Callback = Box<dyn Fn() + Send + Sync>;
type SuccessCallback = Box<dyn Fn(&Value) + Send + Sync>;
type ErrorCallback = Box<dyn Fn(&TransportError) + Send + Sync>;
type RetryCallback = Box<dyn Fn(u32, Duration) + Send + Sync>;
type CompleteCallback = Box<dyn Fn(Status, &Outcome) + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    before_enqueue: Vec<Callback>,
    enqueued: Vec<Callback>,
    success: Vec<SuccessCallback>,
    error: Vec<ErrorCallback>,
    retry: Vec<RetryCallback>,
    fallback: Vec<ErrorCallback>,
    complete: Vec<CompleteCallback>,
}

#[derive(Default)]
pub struct EventEmitter {
    callbacks: Mutex<Callbacks>,
}

macro_rules! emit {
    ($self:ident, $slot:ident, |$cb:ident| $call:expr) => {
        match $self.callbacks.lock() {
            Ok(callbacks) => {
                for $cb in &callbacks.$slot {
                    $call;
                }
            }
            Err(_) => warn!("event callbacks lock poisoned"),
        }
    };
}

macro_rules! bind {
    ($self:ident, $slot:ident, $cb:expr) => {
        if let Ok(mut callbacks) = $self.callbacks.lock() {
            callbacks.$slot.push($cb);
        }
    };
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_before_enqueue(&self, cb: impl Fn() + Send + Sync + 'static) {
        bind!(self, before_enqueue, Box::new(cb));
    }

    pub fn on_enqueued(&self, cb: impl Fn() + Send + Sync + 'static) {
        bind!(self, enqueued, Box::new(cb));
    }

    pub fn on_success(&self, cb: impl Fn(&Value) + Send + Sync + 'static) {
        bind!(self, success, Box::new(cb));
    }

    pub fn on_error(&self, cb: impl Fn(&TransportError) + Send + Sync + 'static) {
        bind!(self, error, Box::new(cb));
    }

    pub fn on_retry(&self, cb: impl Fn(u32, Duration) + Send + Sync + 'static) {
        bind!(self, retry, Box::new(cb));
    }

    pub fn on_fallback(&self, cb: impl Fn(&TransportError) + Send + Sync + 'static) {
        bind!(self, fallback, Box::new(cb));
    }

    pub fn on_complete(&self, cb: impl Fn(Status, &Outcome) + Send + Sync + 'static) {
        bind!(self, complete, Box::new(cb));
    }

    /// Whether a fallback handler is bound. Decides the removal path for
    /// durable items whose retries are exhausted.
    pub fn has_fallback(&self) -> bool {
        self.callbacks
            .lock()
            .map(|c| !c.fallback.is_empty())
            .unwrap_or(false)
    }

    pub fn emit_before_enqueue(&self) {
        emit!(self, before_enqueue, |cb| cb());
    }

    pub fn emit_enqueued(&self) {
        emit!(self, enqueued, |cb| cb());
    }

    pub fn emit_success(&self, response: &Value) {
        emit!(self, success, |cb| cb(response));
    }

    pub fn emit_error(&self, error: &TransportError) {
        emit!(self, error, |cb| cb(error));
    }

    pub fn emit_retry(&self, retry_times: u32, retry_delay: Duration) {
        emit!(self, retry, |cb| cb(retry_times, retry_delay));
    }

    pub fn emit_fallback(&self, error: &TransportError) {
        emit!(self, fallback, |cb| cb(error));
    }

    pub fn emit_complete(&self, status: Status, outcome: &Outcome) {
        emit!(self, complete, |cb| cb(status, outcome));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn bound_callbacks_fire_in_order() {
        let emitter = EventEmitter::new();
        let hits = Arc::new(AtomicU32::new(0));

        let h = hits.clone();
        emitter.on_success(move |resp| {
            assert_eq!(resp.as_i64(), Some(42));
            h.fetch_add(1, Ordering::SeqCst);
        });
        let h = hits.clone();
        emitter.on_success(move |_| {
            h.fetch_add(10, Ordering::SeqCst);
        });

        emitter.emit_success(&Value::from(42));
        assert_eq!(hits.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn fallback_binding_is_observable() {
        let emitter = EventEmitter::new();
        assert!(!emitter.has_fallback());
        emitter.on_fallback(|_| {});
        assert!(emitter.has_fallback());
    }
}
