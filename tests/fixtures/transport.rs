use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use silentq::queue::record::RequestDescriptor;
use silentq::{CancelToken, Transport, TransportError, Value};

/// One recorded transport call.
#[derive(Debug, Clone)]
pub struct Call {
    pub url: String,
    pub body: Value,
    pub at: Instant,
}

/// Scriptable transport: per-url outcome queues, optional per-url latency,
/// and a full call log. Unscripted calls succeed with `Value::Null`.
#[derive(Default)]
pub struct MockTransport {
    scripts: Mutex<HashMap<String, VecDeque<Result<Value, TransportError>>>>,
    latency: Mutex<HashMap<String, Duration>>,
    calls: Mutex<Vec<Call>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue the next outcome for `url`. Outcomes are consumed in order.
    pub fn script(&self, url: &str, outcome: Result<Value, TransportError>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_default()
            .push_back(outcome);
    }

    pub fn script_failures(&self, url: &str, count: usize, error: TransportError) {
        for _ in 0..count {
            self.script(url, Err(error.clone()));
        }
    }

    pub fn set_latency(&self, url: &str, latency: Duration) {
        self.latency
            .lock()
            .unwrap()
            .insert(url.to_string(), latency);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn urls_called(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.url).collect()
    }
}

impl Transport for MockTransport {
    fn execute(
        &self,
        request: &RequestDescriptor,
        cancel: &CancelToken,
    ) -> Result<Value, TransportError> {
        self.calls.lock().unwrap().push(Call {
            url: request.url.clone(),
            body: request.body.clone(),
            at: Instant::now(),
        });
        let latency = self
            .latency
            .lock()
            .unwrap()
            .get(&request.url)
            .copied()
            .unwrap_or(Duration::ZERO);
        if !latency.is_zero() {
            // poll the cancel token while "in flight"
            let deadline = Instant::now() + latency;
            while Instant::now() < deadline {
                if cancel.is_cancelled() {
                    return Err(TransportError::aborted());
                }
                std::thread::sleep(Duration::from_millis(5));
            }
        }
        if cancel.is_cancelled() {
            return Err(TransportError::aborted());
        }
        match self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&request.url)
            .and_then(VecDeque::pop_front)
        {
            Some(outcome) => outcome,
            None => Ok(Value::Null),
        }
    }
}
