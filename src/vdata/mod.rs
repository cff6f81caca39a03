//! Virtual placeholder values.
//!
//! A `VirtualNode` stands in for data the server has not confirmed yet. It
//! carries a process-unique id assigned once at creation; two nodes are the
//! same placeholder iff their ids match, regardless of snapshot content.
//!
//! There are no transparent proxies here: wrapping is an explicit accessor
//! (`access_path`) that wraps nested values on first read and memoizes the
//! wrapper in place, so repeated access yields the identical id. The access
//! side effect is controlled by an explicit `AccessMode` threaded through
//! the call instead of ambient global state.

mod value;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

pub use value::{Kind, Value};

/// Stable identity of a virtual placeholder.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VdataId(String);

impl VdataId {
    pub fn fresh() -> Self {
        VdataId(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn from_raw(raw: impl Into<String>) -> Self {
        VdataId(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VdataId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A virtual placeholder: stable id, primitive-shape kind, best-effort
/// primitive snapshot, and lazily wrapped children.
///
/// Children live beside the snapshot so that even an undefined-kind
/// placeholder can hand out nested placeholders (`resp.list[0].id` works
/// before anything about `resp` is known).
#[derive(Debug, Clone, PartialEq)]
pub struct VirtualNode {
    id: VdataId,
    kind: Kind,
    primitive: Box<Value>,
    children: BTreeMap<String, Value>,
}

impl VirtualNode {
    /// Wrap `defaults` as a fresh placeholder. Container defaults seed the
    /// children map; primitive defaults become the snapshot.
    pub fn fresh(defaults: Value) -> Self {
        Self::with_id(VdataId::fresh(), defaults)
    }

    /// Rebuild a placeholder carrying a known id (deserialization path:
    /// identity must survive process restarts).
    pub fn with_id(id: VdataId, defaults: Value) -> Self {
        match defaults {
            Value::Object(map) => VirtualNode {
                id,
                kind: Kind::Object,
                primitive: Box::new(Value::Undefined),
                children: map,
            },
            Value::Array(items) => VirtualNode {
                id,
                kind: Kind::Array,
                primitive: Box::new(Value::Undefined),
                children: items
                    .into_iter()
                    .enumerate()
                    .map(|(i, v)| (i.to_string(), v))
                    .collect(),
            },
            Value::Virtual(node) => *node,
            primitive => VirtualNode {
                id,
                kind: primitive.kind(),
                primitive: Box::new(primitive),
                children: BTreeMap::new(),
            },
        }
    }

    pub fn id(&self) -> &VdataId {
        &self.id
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn child(&self, key: &str) -> Option<&Value> {
        self.children.get(key)
    }

    pub fn children(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.children.iter()
    }

    pub(crate) fn children_mut(&mut self) -> &mut BTreeMap<String, Value> {
        &mut self.children
    }

    /// Best-effort current primitive: the snapshot for primitive kinds, a
    /// rebuilt plain container for object/array kinds.
    pub fn snapshot(&self) -> Value {
        match self.kind {
            Kind::Object => Value::Object(
                self.children
                    .iter()
                    .map(|(k, v)| (k.clone(), dehydrate(v)))
                    .collect(),
            ),
            Kind::Array => {
                let mut indexed: Vec<(usize, Value)> = self
                    .children
                    .iter()
                    .filter_map(|(k, v)| k.parse().ok().map(|i| (i, dehydrate(v))))
                    .collect();
                indexed.sort_by_key(|(i, _)| *i);
                Value::Array(indexed.into_iter().map(|(_, v)| v).collect())
            }
            _ => dehydrate(&self.primitive),
        }
    }
}

impl fmt::Display for VirtualNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            Kind::Object | Kind::Array => write!(f, "[vdata:{}]", self.id),
            _ => self.snapshot().fmt(f),
        }
    }
}

/// Wrap `defaults` as a virtual placeholder value. This is how a caller
/// builds a speculative response shape before the request is sent.
pub fn virtualize(defaults: Value) -> Value {
    Value::Virtual(Box::new(VirtualNode::fresh(defaults)))
}

/// One step of a value path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Key {
    Field(String),
    Index(usize),
}

impl Key {
    fn as_child_key(&self) -> String {
        match self {
            Key::Field(name) => name.clone(),
            Key::Index(i) => i.to_string(),
        }
    }
}

impl From<&str> for Key {
    fn from(name: &str) -> Self {
        Key::Field(name.to_string())
    }
}

impl From<usize> for Key {
    fn from(i: usize) -> Self {
        Key::Index(i)
    }
}

/// Records which placeholder ids were read during a `Collecting` access.
#[derive(Debug, Default)]
pub struct VdataCollector {
    ids: BTreeSet<VdataId>,
}

impl VdataCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, id: &VdataId) {
        self.ids.insert(id.clone());
    }

    pub fn into_ids(self) -> BTreeSet<VdataId> {
        self.ids
    }
}

/// Access side-effect mode, threaded explicitly through `access_path`.
pub enum AccessMode<'a> {
    /// Return the dehydrated underlying value. Used internally while
    /// serializing so internals aren't double-wrapped.
    Transparent,
    /// Record every placeholder id traversed. Used to discover which ids a
    /// computed request actually depends on.
    Collecting(&'a mut VdataCollector),
    /// Default: nested values are wrapped as placeholders on first access
    /// and memoized in place.
    Wrapping,
}

/// Navigate `root` along `path` under the given mode, returning a clone of
/// the reached value. Never fails: an unreachable path yields `Undefined`
/// (in `Wrapping` mode, unreachable steps inside a placeholder materialize
/// undefined-kind children instead, which keeps chained speculative access
/// like `resp.items[0].id` working).
pub fn access_path(root: &mut Value, path: &[Key], mode: AccessMode<'_>) -> Value {
    match mode {
        AccessMode::Wrapping => access_wrapping(root, path),
        AccessMode::Collecting(collector) => {
            let found = access_readonly(root, path, &mut Some(collector));
            found.cloned().unwrap_or(Value::Undefined)
        }
        AccessMode::Transparent => {
            let found = access_readonly(root, path, &mut None);
            found.map(dehydrate).unwrap_or(Value::Undefined)
        }
    }
}

fn access_wrapping(root: &mut Value, path: &[Key]) -> Value {
    let Some((key, rest)) = path.split_first() else {
        return root.clone();
    };
    let child_key = key.as_child_key();
    match root {
        Value::Virtual(node) => {
            let entry = node
                .children_mut()
                .entry(child_key)
                .or_insert_with(|| virtualize(Value::Undefined));
            if !entry.is_virtual() {
                let plain = std::mem::take(entry);
                *entry = virtualize(plain);
            }
            access_wrapping(entry, rest)
        }
        Value::Object(map) => match map.get_mut(&child_key) {
            Some(child) => access_wrapping(child, rest),
            None => Value::Undefined,
        },
        Value::Array(items) => match key {
            Key::Index(i) => match items.get_mut(*i) {
                Some(child) => access_wrapping(child, rest),
                None => Value::Undefined,
            },
            Key::Field(_) => Value::Undefined,
        },
        _ => Value::Undefined,
    }
}

fn access_readonly<'v>(
    root: &'v Value,
    path: &[Key],
    collector: &mut Option<&mut VdataCollector>,
) -> Option<&'v Value> {
    if let (Value::Virtual(node), Some(c)) = (root, collector.as_deref_mut()) {
        c.record(node.id());
    }
    let (key, rest) = match path.split_first() {
        Some(split) => split,
        None => return Some(root),
    };
    let child = match root {
        Value::Virtual(node) => node.child(&key.as_child_key()),
        Value::Object(map) => map.get(&key.as_child_key()),
        Value::Array(items) => match key {
            Key::Index(i) => items.get(*i),
            Key::Field(_) => None,
        },
        _ => None,
    };
    child.and_then(|c| access_readonly(c, rest, collector))
}

/// Deep-strip a value to plain data: every placeholder is replaced by its
/// best-effort primitive snapshot. Never fails.
pub fn dehydrate(value: &Value) -> Value {
    match value {
        Value::Virtual(node) => node.snapshot(),
        Value::Object(map) => Value::Object(map.iter().map(|(k, v)| (k.clone(), dehydrate(v))).collect()),
        Value::Array(items) => Value::Array(items.iter().map(dehydrate).collect()),
        other => other.clone(),
    }
}

/// All placeholder ids reachable in a value tree.
pub fn collect_ids(value: &Value) -> BTreeSet<VdataId> {
    fn walk(value: &Value, out: &mut BTreeSet<VdataId>) {
        match value {
            Value::Virtual(node) => {
                out.insert(node.id().clone());
                walk(&node.primitive, out);
                for (_, child) in node.children() {
                    walk(child, out);
                }
            }
            Value::Object(map) => {
                for child in map.values() {
                    walk(child, out);
                }
            }
            Value::Array(items) => {
                for child in items {
                    walk(child, out);
                }
            }
            _ => {}
        }
    }
    let mut out = BTreeSet::new();
    walk(value, &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn speculative_response() -> Value {
        virtualize(Value::object([
            ("id", Value::from(1)),
            ("text", Value::from("draft")),
        ]))
    }

    #[test]
    fn id_is_stable_across_reads() {
        let mut resp = speculative_response();
        let path = [Key::from("id")];
        let first = access_path(&mut resp, &path, AccessMode::Wrapping);
        let second = access_path(&mut resp, &path, AccessMode::Wrapping);
        let (Value::Virtual(a), Value::Virtual(b)) = (first, second) else {
            panic!("wrapped access should yield virtual values");
        };
        assert_eq!(a.id(), b.id());
    }

    #[test]
    fn missing_fields_materialize_undefined_placeholders() {
        let mut resp = speculative_response();
        let path = [Key::from("extra"), Key::from(0usize)];
        let reached = access_path(&mut resp, &path, AccessMode::Wrapping);
        let Value::Virtual(node) = reached else {
            panic!("expected a placeholder");
        };
        assert_eq!(node.kind(), Kind::Undefined);
        // memoized: same id the second time around
        let again = access_path(&mut resp, &path, AccessMode::Wrapping);
        let Value::Virtual(node2) = again else {
            panic!("expected a placeholder");
        };
        assert_eq!(node.id(), node2.id());
    }

    #[test]
    fn transparent_access_dehydrates() {
        let mut resp = speculative_response();
        let wrapped = access_path(&mut resp, &[Key::from("id")], AccessMode::Wrapping);
        assert!(wrapped.is_virtual());
        let seen = access_path(&mut resp, &[Key::from("id")], AccessMode::Transparent);
        assert_eq!(seen, Value::from(1));
    }

    #[test]
    fn collecting_records_traversed_ids() {
        let mut resp = speculative_response();
        access_path(&mut resp, &[Key::from("id")], AccessMode::Wrapping);
        let mut collector = VdataCollector::new();
        access_path(
            &mut resp,
            &[Key::from("id")],
            AccessMode::Collecting(&mut collector),
        );
        // root placeholder + the wrapped `id` field
        assert_eq!(collector.into_ids().len(), 2);
    }

    #[test]
    fn dehydrate_rebuilds_plain_containers() {
        let mut resp = speculative_response();
        access_path(&mut resp, &[Key::from("id")], AccessMode::Wrapping);
        let plain = dehydrate(&resp);
        assert_eq!(
            plain,
            Value::object([("id", Value::from(1)), ("text", Value::from("draft"))])
        );
    }

    #[test]
    fn collect_ids_is_deep() {
        let mut resp = speculative_response();
        access_path(&mut resp, &[Key::from("id")], AccessMode::Wrapping);
        let body = Value::object([("ref", access_path(&mut resp, &[Key::from("id")], AccessMode::Wrapping))]);
        let ids = collect_ids(&body);
        assert_eq!(ids.len(), 1);
        assert_eq!(collect_ids(&resp).len(), 2);
    }
}
