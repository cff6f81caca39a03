//! Pluggable value serialization for persisted queue entries.
//!
//! Values that are not naturally JSON-representable (timestamps, regex
//! patterns, custom domain types, virtual placeholders) are converted to a
//! JSON-safe tagged form and back:
//!
//! - a serializer match emits `["name", payload]`;
//! - a virtual placeholder emits `{"__$k": id, "__$v": ..., <children>}`,
//!   preserving the placeholder id across process restarts.
//!
//! Registry lookup order is registration order, first match wins. The
//! built-in `date` and `regexp` serializers are pre-registered and may be
//! overridden by re-registering the same name.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{json, Map, Number, Value as Json};
use thiserror::Error;
use time::OffsetDateTime;

use crate::vdata::{Kind, Value, VdataId, VirtualNode};

/// Tag key carrying a placeholder id.
pub const VTAG_ID_KEY: &str = "__$k";
/// Tag key carrying a placeholder's serialized primitive snapshot.
pub const VTAG_VALUE_KEY: &str = "__$v";

#[derive(Debug, Error)]
pub enum SerializeError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A plugged-in serializer failed. Programmer error, not caught or
    /// degraded anywhere in this crate.
    #[error("serializer '{name}' failed: {reason}")]
    Serializer { name: String, reason: String },

    #[error("malformed persisted value: {reason}")]
    Malformed { reason: String },
}

/// A bidirectional transform for one class of non-JSON values.
///
/// `forward` returning `None` means "this serializer does not apply".
/// `backward` restores the value from the tagged payload; round trips must
/// be value-equal (`backward(forward(v)) == v`), not reference-equal.
pub trait ValueSerializer: Send + Sync {
    fn forward(&self, value: &Value) -> Option<Json>;
    fn backward(&self, payload: &Json) -> Result<Value, SerializeError>;
}

struct DateSerializer;

impl ValueSerializer for DateSerializer {
    fn forward(&self, value: &Value) -> Option<Json> {
        match value {
            Value::Timestamp(ts) => {
                let ms = ts.unix_timestamp_nanos() / 1_000_000;
                Some(Json::Number(Number::from(ms as i64)))
            }
            _ => None,
        }
    }

    fn backward(&self, payload: &Json) -> Result<Value, SerializeError> {
        let ms = payload.as_i64().ok_or_else(|| SerializeError::Serializer {
            name: "date".into(),
            reason: format!("expected epoch milliseconds, got {payload}"),
        })?;
        let ts = OffsetDateTime::from_unix_timestamp_nanos(i128::from(ms) * 1_000_000).map_err(
            |e| SerializeError::Serializer {
                name: "date".into(),
                reason: e.to_string(),
            },
        )?;
        Ok(Value::Timestamp(ts))
    }
}

struct RegexpSerializer;

impl ValueSerializer for RegexpSerializer {
    fn forward(&self, value: &Value) -> Option<Json> {
        match value {
            Value::Regex(pattern) => Some(Json::String(pattern.clone())),
            _ => None,
        }
    }

    fn backward(&self, payload: &Json) -> Result<Value, SerializeError> {
        let pattern = payload.as_str().ok_or_else(|| SerializeError::Serializer {
            name: "regexp".into(),
            reason: format!("expected pattern string, got {payload}"),
        })?;
        Ok(Value::Regex(pattern.to_string()))
    }
}

/// Ordered name → serializer registry.
pub struct SerializerRegistry {
    entries: Vec<(String, Arc<dyn ValueSerializer>)>,
}

impl Default for SerializerRegistry {
    fn default() -> Self {
        let mut registry = SerializerRegistry {
            entries: Vec::new(),
        };
        registry.register("date", Arc::new(DateSerializer));
        registry.register("regexp", Arc::new(RegexpSerializer));
        registry
    }
}

impl SerializerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or overwrite by name. Overwriting keeps the original
    /// position so built-in overrides keep built-in precedence.
    pub fn register(&mut self, name: impl Into<String>, serializer: Arc<dyn ValueSerializer>) {
        let name = name.into();
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = serializer,
            None => self.entries.push((name, serializer)),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn first_match(&self, value: &Value) -> Option<(&str, Json)> {
        self.entries
            .iter()
            .find_map(|(name, s)| s.forward(value).map(|payload| (name.as_str(), payload)))
    }

    fn lookup(&self, name: &str) -> Option<&Arc<dyn ValueSerializer>> {
        self.entries
            .iter()
            .find_map(|(n, s)| (n == name).then_some(s))
    }

    /// Serialize a value tree to a JSON string.
    pub fn serialize(&self, value: &Value) -> Result<String, SerializeError> {
        let json = self.serialize_tree(value)?;
        Ok(serde_json::to_string(&json)?)
    }

    /// Serialize a value tree to a JSON tree (persisted record building
    /// composes several of these into one document).
    pub fn serialize_tree(&self, value: &Value) -> Result<Json, SerializeError> {
        match value {
            Value::Virtual(node) => self.serialize_virtual(node),
            Value::Object(map) => {
                let mut out = Map::new();
                for (key, child) in map {
                    // JSON has no undefined; drop the field entirely.
                    if matches!(child, Value::Undefined) {
                        continue;
                    }
                    out.insert(key.clone(), self.serialize_tree(child)?);
                }
                Ok(Json::Object(out))
            }
            Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for child in items {
                    out.push(match child {
                        Value::Undefined => Json::Null,
                        other => self.serialize_tree(other)?,
                    });
                }
                Ok(Json::Array(out))
            }
            Value::Undefined | Value::Null => Ok(Json::Null),
            Value::Bool(b) => Ok(Json::Bool(*b)),
            Value::Number(n) => Ok(Json::Number(n.clone())),
            Value::String(s) => Ok(Json::String(s.clone())),
            other => match self.first_match(other) {
                Some((name, payload)) => Ok(json!([name, payload])),
                // No serializer claims this non-JSON leaf; degrade to its
                // display form rather than erroring.
                None => Ok(Json::String(other.to_string())),
            },
        }
    }

    fn serialize_virtual(&self, node: &VirtualNode) -> Result<Json, SerializeError> {
        let mut out = Map::new();
        out.insert(VTAG_ID_KEY.into(), Json::String(node.id().to_string()));
        match node.kind() {
            // Undefined-kind placeholders carry no snapshot at all.
            Kind::Undefined => {}
            Kind::Object => {
                out.insert(VTAG_VALUE_KEY.into(), Json::Object(Map::new()));
            }
            Kind::Array => {
                out.insert(VTAG_VALUE_KEY.into(), Json::Array(Vec::new()));
            }
            _ => {
                let snapshot = node.snapshot();
                let payload = match self.first_match(&snapshot) {
                    Some((name, payload)) => json!([name, payload]),
                    None => self.serialize_tree(&snapshot)?,
                };
                out.insert(VTAG_VALUE_KEY.into(), payload);
            }
        }
        for (key, child) in node.children() {
            if matches!(child, Value::Undefined) {
                continue;
            }
            out.insert(key.clone(), self.serialize_tree(child)?);
        }
        Ok(Json::Object(out))
    }

    /// Deserialize a JSON string back into a value tree. Placeholder ids
    /// are restored exactly; a tagged payload whose serializer name is no
    /// longer registered passes through unchanged (recoverable
    /// degradation, not a hard failure).
    pub fn deserialize(&self, raw: &str) -> Result<Value, SerializeError> {
        let json: Json = serde_json::from_str(raw)?;
        self.restore_tree(&json)
    }

    pub fn restore_tree(&self, json: &Json) -> Result<Value, SerializeError> {
        match json {
            Json::Object(map) if map.contains_key(VTAG_ID_KEY) => self.restore_virtual(map),
            Json::Object(map) => {
                let mut out = BTreeMap::new();
                for (key, child) in map {
                    out.insert(key.clone(), self.restore_tree(child)?);
                }
                Ok(Value::Object(out))
            }
            Json::Array(items) => match tag_parts(items) {
                Some((name, payload)) => match self.lookup(name) {
                    Some(serializer) => serializer.backward(payload),
                    None => self.restore_tree(payload),
                },
                None => {
                    let mut out = Vec::with_capacity(items.len());
                    for child in items {
                        out.push(self.restore_tree(child)?);
                    }
                    Ok(Value::Array(out))
                }
            },
            Json::Null => Ok(Value::Null),
            Json::Bool(b) => Ok(Value::Bool(*b)),
            Json::Number(n) => Ok(Value::Number(n.clone())),
            Json::String(s) => Ok(Value::String(s.clone())),
        }
    }

    fn restore_virtual(&self, map: &Map<String, Json>) -> Result<Value, SerializeError> {
        let id = map
            .get(VTAG_ID_KEY)
            .and_then(Json::as_str)
            .ok_or_else(|| SerializeError::Malformed {
                reason: format!("{VTAG_ID_KEY} must be a string"),
            })?;
        let base = match map.get(VTAG_VALUE_KEY) {
            None => Value::Undefined,
            Some(Json::Object(_)) => Value::Object(BTreeMap::new()),
            Some(Json::Array(items)) if tag_parts(items).is_none() => Value::Array(Vec::new()),
            Some(other) => self.restore_tree(other)?,
        };
        let mut node = VirtualNode::with_id(VdataId::from_raw(id), base);
        for (key, child) in map {
            if key == VTAG_ID_KEY || key == VTAG_VALUE_KEY {
                continue;
            }
            node.children_mut()
                .insert(key.clone(), self.restore_tree(child)?);
        }
        Ok(Value::Virtual(Box::new(node)))
    }
}

/// A two-element array `["name", payload]` is the serializer tag form.
/// Plain user arrays of that exact shape are reserved by the format; the
/// restore side only intercepts them when the name is registered.
fn tag_parts(items: &[Json]) -> Option<(&str, &Json)> {
    match items {
        [Json::String(name), payload] => Some((name.as_str(), payload)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vdata::{access_path, collect_ids, virtualize, AccessMode, Key};
    use time::macros::datetime;

    fn registry() -> SerializerRegistry {
        SerializerRegistry::new()
    }

    #[test]
    fn builtins_are_preregistered() {
        assert_eq!(registry().len(), 2);
    }

    #[test]
    fn date_round_trip() {
        let reg = registry();
        let ts = Value::Timestamp(datetime!(2022-10-01 00:00:00 UTC));
        let raw = reg.serialize(&ts).unwrap();
        assert_eq!(raw, r#"["date",1664582400000]"#);
        assert_eq!(reg.deserialize(&raw).unwrap(), ts);
    }

    #[test]
    fn regexp_round_trip() {
        let reg = registry();
        let re = Value::Regex("^123[a-z]+$".into());
        let raw = reg.serialize(&re).unwrap();
        assert_eq!(reg.deserialize(&raw).unwrap(), re);
    }

    #[test]
    fn custom_serializer_first_match_wins() {
        struct Custom;
        impl ValueSerializer for Custom {
            fn forward(&self, value: &Value) -> Option<Json> {
                match value {
                    Value::String(s) if s == "a,a" => Some(Json::String("2a".into())),
                    _ => None,
                }
            }
            fn backward(&self, _payload: &Json) -> Result<Value, SerializeError> {
                Ok(Value::String("a,a".into()))
            }
        }
        let mut reg = registry();
        reg.register("custom", Arc::new(Custom));
        assert_eq!(reg.len(), 3);

        // Plain strings are not run through serializers, but placeholder
        // snapshots are.
        let wrapped = virtualize(Value::from("a,a"));
        let raw = reg.serialize(&wrapped).unwrap();
        assert!(raw.contains(r#"["custom","2a"]"#));
        let restored = reg.deserialize(&raw).unwrap();
        let Value::Virtual(node) = restored else {
            panic!("expected placeholder");
        };
        assert_eq!(node.snapshot(), Value::from("a,a"));
    }

    #[test]
    fn overriding_a_builtin_keeps_its_position() {
        struct NoopDate;
        impl ValueSerializer for NoopDate {
            fn forward(&self, _value: &Value) -> Option<Json> {
                None
            }
            fn backward(&self, payload: &Json) -> Result<Value, SerializeError> {
                Ok(Value::Number(payload.as_i64().unwrap_or(0).into()))
            }
        }
        let mut reg = registry();
        reg.register("date", Arc::new(NoopDate));
        assert_eq!(reg.len(), 2);
        // forward no longer claims timestamps; they degrade to display form
        let raw = reg
            .serialize(&Value::Timestamp(datetime!(2022-10-01 00:00:00 UTC)))
            .unwrap();
        assert!(raw.starts_with('"'));
    }

    #[test]
    fn placeholder_ids_survive_round_trip() {
        let reg = registry();
        let mut resp = virtualize(Value::object([
            ("id", Value::from(1)),
            ("time", Value::Timestamp(datetime!(2022-10-01 00:00:00 UTC))),
        ]));
        access_path(&mut resp, &[Key::from("id")], AccessMode::Wrapping);
        access_path(&mut resp, &[Key::from("time")], AccessMode::Wrapping);
        access_path(
            &mut resp,
            &[Key::from("e"), Key::from(0usize)],
            AccessMode::Wrapping,
        );
        let before = collect_ids(&resp);
        assert_eq!(before.len(), 5);

        let raw = reg.serialize(&resp).unwrap();
        let restored = reg.deserialize(&raw).unwrap();
        assert_eq!(collect_ids(&restored), before);

        // the timestamp snapshot survives value-equal
        let Value::Virtual(node) = &restored else {
            panic!("expected placeholder");
        };
        let time_child = node.child("time").expect("time child");
        let Value::Virtual(time_node) = time_child else {
            panic!("expected wrapped time");
        };
        assert_eq!(
            time_node.snapshot(),
            Value::Timestamp(datetime!(2022-10-01 00:00:00 UTC))
        );
    }

    #[test]
    fn unknown_tag_name_passes_payload_through() {
        let reg = registry();
        let restored = reg.deserialize(r#"["gone",42]"#).unwrap();
        assert_eq!(restored, Value::from(42));
    }

    #[test]
    fn undefined_fields_are_dropped() {
        let reg = registry();
        let value = Value::object([
            ("keep", Value::from(1)),
            ("drop", Value::Undefined),
            ("arr", Value::array([Value::Undefined, Value::from(2)])),
        ]);
        let raw = reg.serialize(&value).unwrap();
        assert_eq!(raw, r#"{"arr":[null,2],"keep":1}"#);
    }
}
