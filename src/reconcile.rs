//! Reconciliation: swapping virtual placeholders for real response data.
//!
//! Targets are registered per queued-request id and resolved by matcher
//! lookup at reconciliation time, never by captured references, so the
//! update applies even when the component that submitted the request is
//! long gone. A matcher that resolves to nothing is silently skipped.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, Weak};

use tracing::debug;

use crate::vdata::{Value, VdataId};

/// A live named state container. Holders keep the `Arc`; the hub keeps a
/// `Weak`, so dropping the last holder is how a container stops being
/// "live".
pub struct StateCell {
    name: String,
    value: Mutex<Value>,
}

impl StateCell {
    pub fn new(name: impl Into<String>, value: Value) -> Arc<Self> {
        Arc::new(StateCell {
            name: name.into(),
            value: Mutex::new(value),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self) -> Value {
        self.value
            .lock()
            .map(|v| v.clone())
            .unwrap_or(Value::Undefined)
    }

    pub fn set(&self, value: Value) {
        if let Ok(mut slot) = self.value.lock() {
            *slot = value;
        }
    }

    /// Read-modify-write one top-level field of an object-shaped state.
    pub fn update_field(&self, field: &str, f: impl FnOnce(Value) -> Value) {
        let Ok(mut slot) = self.value.lock() else {
            return;
        };
        if let Value::Object(map) = &mut *slot {
            let current = map.remove(field).unwrap_or(Value::Undefined);
            map.insert(field.to_string(), f(current));
        }
    }
}

/// Which future state container(s) a reconciliation target addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateMatcher {
    Exact(String),
    Prefix(String),
    Pattern(String),
}

impl StateMatcher {
    pub fn matches(&self, name: &str) -> bool {
        match self {
            StateMatcher::Exact(expected) => name == expected,
            StateMatcher::Prefix(prefix) => name.starts_with(prefix.as_str()),
            StateMatcher::Pattern(pattern) => regex::Regex::new(pattern)
                .map(|re| re.is_match(name))
                .unwrap_or(false),
        }
    }
}

type TransformFn = Box<dyn Fn(Value) -> Value + Send + Sync>;

/// One registered "update this state when I resolve" request.
pub struct ReconcileTarget {
    pub matcher: StateMatcher,
    pub fields: Vec<String>,
    pub transform: TransformFn,
}

/// Registry of live state containers.
#[derive(Default)]
pub struct StateHub {
    cells: Mutex<Vec<Weak<StateCell>>>,
}

impl StateHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, cell: &Arc<StateCell>) {
        if let Ok(mut cells) = self.cells.lock() {
            cells.push(Arc::downgrade(cell));
        }
    }

    /// Live containers whose name matches. Dead weak refs are pruned as a
    /// side effect.
    pub fn resolve(&self, matcher: &StateMatcher) -> Vec<Arc<StateCell>> {
        let Ok(mut cells) = self.cells.lock() else {
            return Vec::new();
        };
        cells.retain(|weak| weak.strong_count() > 0);
        cells
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|cell| matcher.matches(cell.name()))
            .collect()
    }
}

/// Per-request reconciliation target registry plus the substitution
/// machinery.
#[derive(Default)]
pub struct Reconciler {
    hub: StateHub,
    targets: Mutex<HashMap<String, Vec<ReconcileTarget>>>,
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hub(&self) -> &StateHub {
        &self.hub
    }

    pub fn register_target(&self, request_id: &str, target: ReconcileTarget) {
        if let Ok(mut targets) = self.targets.lock() {
            targets.entry(request_id.to_string()).or_default().push(target);
        }
    }

    /// Drop targets for a request that terminated without success.
    pub fn discard_targets(&self, request_id: &str) {
        if let Ok(mut targets) = self.targets.lock() {
            targets.remove(request_id);
        }
    }

    /// Apply reconciliation for a successful request: resolve its
    /// placeholder ids against the real response, then run every
    /// registered target against the live containers its matcher finds.
    /// Runs exactly once per request; targets are consumed.
    ///
    /// Returns the resolution map so the scheduler can also rewrite
    /// requests still waiting in other queues.
    pub fn reconcile(
        &self,
        request_id: &str,
        vdata_ids: &BTreeSet<VdataId>,
        virtual_response: Option<&Value>,
        response: &Value,
    ) -> BTreeMap<VdataId, Value> {
        let mut resolutions = BTreeMap::new();
        if let Some(virtual_response) = virtual_response {
            resolve_map(virtual_response, response, &mut resolutions);
        }
        resolutions.retain(|id, _| vdata_ids.contains(id));

        let targets = self
            .targets
            .lock()
            .ok()
            .and_then(|mut t| t.remove(request_id))
            .unwrap_or_default();

        for target in targets {
            let cells = self.hub.resolve(&target.matcher);
            if cells.is_empty() {
                // container no longer exists; caller owns matcher correctness
                debug!(request_id, "reconciliation target matched no live state");
                continue;
            }
            for cell in cells {
                for field in &target.fields {
                    cell.update_field(field, |current| {
                        (target.transform)(substitute(current, &resolutions))
                    });
                }
            }
        }

        if !resolutions.is_empty() {
            debug!(
                request_id,
                resolved = resolutions.len(),
                "virtual values reconciled"
            );
        }
        resolutions
    }
}

/// Walk the speculative response alongside the real one; a placeholder at
/// path *p* resolves to the real value at *p*. Ids with no counterpart
/// resolve to `Undefined`.
pub fn resolve_map(virtual_value: &Value, real: &Value, out: &mut BTreeMap<VdataId, Value>) {
    match virtual_value {
        Value::Virtual(node) => {
            out.insert(node.id().clone(), real.clone());
            for (key, child) in node.children() {
                let real_child = match real {
                    Value::Object(map) => map.get(key).cloned().unwrap_or(Value::Undefined),
                    Value::Array(items) => key
                        .parse::<usize>()
                        .ok()
                        .and_then(|i| items.get(i).cloned())
                        .unwrap_or(Value::Undefined),
                    _ => Value::Undefined,
                };
                resolve_map(child, &real_child, out);
            }
        }
        Value::Object(map) => {
            for (key, child) in map {
                let real_child = real.get(key).cloned().unwrap_or(Value::Undefined);
                resolve_map(child, &real_child, out);
            }
        }
        Value::Array(items) => {
            for (i, child) in items.iter().enumerate() {
                let real_child = real.get_index(i).cloned().unwrap_or(Value::Undefined);
                resolve_map(child, &real_child, out);
            }
        }
        _ => {}
    }
}

/// Deep-replace every placeholder whose id has a resolution with its real
/// value. Unresolved placeholders are kept (their children substituted).
pub fn substitute(value: Value, resolutions: &BTreeMap<VdataId, Value>) -> Value {
    if resolutions.is_empty() {
        return value;
    }
    match value {
        Value::Virtual(mut node) => {
            if let Some(real) = resolutions.get(node.id()) {
                return real.clone();
            }
            let children = std::mem::take(node.children_mut());
            *node.children_mut() = children
                .into_iter()
                .map(|(k, v)| (k, substitute(v, resolutions)))
                .collect();
            Value::Virtual(node)
        }
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, substitute(v, resolutions)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|v| substitute(v, resolutions))
                .collect(),
        ),
        other => other,
    }
}

/// Count of placeholders a substitution would replace. Used to decide
/// whether a waiting durable record needs re-persisting.
pub fn substitution_hits(value: &Value, resolutions: &BTreeMap<VdataId, Value>) -> usize {
    if resolutions.is_empty() {
        return 0;
    }
    match value {
        Value::Virtual(node) => {
            if resolutions.contains_key(node.id()) {
                1
            } else {
                node.children()
                    .map(|(_, child)| substitution_hits(child, resolutions))
                    .sum()
            }
        }
        Value::Object(map) => map
            .values()
            .map(|child| substitution_hits(child, resolutions))
            .sum(),
        Value::Array(items) => items
            .iter()
            .map(|child| substitution_hits(child, resolutions))
            .sum(),
        _ => 0,
    }
}
