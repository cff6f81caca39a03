//! The persisted unit of work and its storage operations.
//!
//! A record and the named-queue index are written as one logical unit:
//! record under `sq.<id>`, ordered id list under `sq.queues`. Either write
//! can be missing after a crash; `load_queues` reconciles by discarding
//! index entries whose record is gone and records no index references.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::{json, Map, Value as Json};
use tracing::warn;

use super::{Behavior, QueueError, RetryPolicy, Status};
use crate::serializer::SerializerRegistry;
use crate::storage::PersistentStore;
use crate::vdata::{collect_ids, Value, VdataId};

/// Storage key prefix for individual records.
pub const RECORD_KEY_PREFIX: &str = "sq.";
/// Storage key of the queue-name → id-list index.
pub const QUEUE_INDEX_KEY: &str = "sq.queues";

pub fn record_key(id: &str) -> String {
    format!("{RECORD_KEY_PREFIX}{id}")
}

/// The request descriptor forwarded to the transport collaborator. Opaque
/// to the queue core except that its values may embed virtual
/// placeholders.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestDescriptor {
    pub method: String,
    pub url: String,
    pub params: BTreeMap<String, Value>,
    pub body: Value,
    pub cache_expire_ms: Option<u64>,
}

impl RequestDescriptor {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        RequestDescriptor {
            method: method.into(),
            url: url.into(),
            ..RequestDescriptor::default()
        }
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = body;
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }
}

/// One persisted unit of work.
#[derive(Debug, Clone)]
pub struct QueuedRequest {
    pub id: String,
    pub queue: String,
    pub behavior: Behavior,
    pub entity: RequestDescriptor,
    pub retry: RetryPolicy,
    /// Original call arguments; may embed virtual placeholders.
    pub handler_args: Value,
    /// The speculative response shape the caller built before submitting.
    pub virtual_response: Option<Value>,
    /// Placeholder ids this request produced, for reconciliation
    /// targeting.
    pub vdata_ids: BTreeSet<VdataId>,
    pub status: Status,
    pub retry_count: u32,
}

impl QueuedRequest {
    pub fn new(
        queue: impl Into<String>,
        behavior: Behavior,
        entity: RequestDescriptor,
        retry: RetryPolicy,
        handler_args: Value,
        virtual_response: Option<Value>,
    ) -> Self {
        let mut vdata_ids = collect_ids(&handler_args);
        if let Some(resp) = &virtual_response {
            vdata_ids.extend(collect_ids(resp));
        }
        vdata_ids.extend(collect_ids(&entity.body));
        for value in entity.params.values() {
            vdata_ids.extend(collect_ids(value));
        }
        QueuedRequest {
            id: uuid::Uuid::new_v4().simple().to_string(),
            queue: queue.into(),
            behavior,
            entity,
            retry,
            handler_args,
            virtual_response,
            vdata_ids,
            status: Status::Pending,
            retry_count: 0,
        }
    }

    pub fn is_durable(&self) -> bool {
        self.behavior.is_durable()
    }

    /// Serialize to the persisted record shape. Virtual placeholders and
    /// non-JSON leaves are pre-tagged by the registry.
    pub fn to_record(&self, registry: &SerializerRegistry) -> Result<String, QueueError> {
        let mut params = Map::new();
        for (key, value) in &self.entity.params {
            params.insert(key.clone(), registry.serialize_tree(value)?);
        }
        let record = json!({
            "id": self.id,
            "queue": self.queue,
            "behavior": serde_json::to_value(self.behavior).map_err(crate::serializer::SerializeError::from)?,
            "entity": {
                "method": self.entity.method,
                "url": self.entity.url,
                "params": params,
                "body": registry.serialize_tree(&self.entity.body)?,
                "cache_expire_ms": self.entity.cache_expire_ms,
            },
            "retry_error": serde_json::to_value(&self.retry.match_rule).map_err(crate::serializer::SerializeError::from)?,
            "max_retry_times": self.retry.max_retries,
            "backoff": serde_json::to_value(&self.retry.backoff).map_err(crate::serializer::SerializeError::from)?,
            "handler_args": registry.serialize_tree(&self.handler_args)?,
            "virtual_response": match &self.virtual_response {
                Some(resp) => registry.serialize_tree(resp)?,
                None => Json::Null,
            },
            "vdata_ids": self.vdata_ids.iter().map(|id| id.as_str()).collect::<Vec<_>>(),
            "retry_count": self.retry_count,
        });
        Ok(serde_json::to_string(&record).map_err(crate::serializer::SerializeError::from)?)
    }

    /// Rebuild from a persisted record. Restored records come back
    /// `Pending` with their retry count intact.
    pub fn from_record(registry: &SerializerRegistry, raw: &str) -> Result<Self, QueueError> {
        let record: Json =
            serde_json::from_str(raw).map_err(crate::serializer::SerializeError::from)?;
        let field = |name: &str| {
            record
                .get(name)
                .cloned()
                .ok_or_else(|| QueueError::MalformedRecord(format!("missing field '{name}'")))
        };
        let id = field("id")?
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| QueueError::MalformedRecord("id must be a string".into()))?;
        let queue = field("queue")?
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| QueueError::MalformedRecord("queue must be a string".into()))?;
        let behavior: Behavior = serde_json::from_value(field("behavior")?)
            .map_err(crate::serializer::SerializeError::from)?;
        let entity_json = field("entity")?;
        let mut params = BTreeMap::new();
        if let Some(map) = entity_json.get("params").and_then(Json::as_object) {
            for (key, value) in map {
                params.insert(key.clone(), registry.restore_tree(value)?);
            }
        }
        let entity = RequestDescriptor {
            method: entity_json
                .get("method")
                .and_then(Json::as_str)
                .unwrap_or_default()
                .to_string(),
            url: entity_json
                .get("url")
                .and_then(Json::as_str)
                .unwrap_or_default()
                .to_string(),
            params,
            body: registry.restore_tree(entity_json.get("body").unwrap_or(&Json::Null))?,
            cache_expire_ms: entity_json.get("cache_expire_ms").and_then(Json::as_u64),
        };
        let retry = RetryPolicy {
            match_rule: serde_json::from_value(field("retry_error")?)
                .map_err(crate::serializer::SerializeError::from)?,
            max_retries: field("max_retry_times")?.as_u64().unwrap_or(0) as u32,
            backoff: serde_json::from_value(field("backoff")?)
                .map_err(crate::serializer::SerializeError::from)?,
        };
        let handler_args = registry.restore_tree(&field("handler_args")?)?;
        let virtual_response = match field("virtual_response")? {
            Json::Null => None,
            other => Some(registry.restore_tree(&other)?),
        };
        let vdata_ids = field("vdata_ids")?
            .as_array()
            .map(|ids| {
                ids.iter()
                    .filter_map(Json::as_str)
                    .map(VdataId::from_raw)
                    .collect()
            })
            .unwrap_or_default();
        Ok(QueuedRequest {
            id,
            queue,
            behavior,
            entity,
            retry,
            handler_args,
            virtual_response,
            vdata_ids,
            status: Status::Pending,
            retry_count: field("retry_count")?.as_u64().unwrap_or(0) as u32,
        })
    }
}

type QueueIndex = BTreeMap<String, Vec<String>>;

fn read_index(store: &dyn PersistentStore) -> QueueIndex {
    match store.get(QUEUE_INDEX_KEY) {
        Ok(Some(raw)) => serde_json::from_str(&raw).unwrap_or_else(|e| {
            warn!("queue index unreadable, starting empty: {e}");
            QueueIndex::new()
        }),
        Ok(None) => QueueIndex::new(),
        Err(e) => {
            warn!("queue index load failed: {e}");
            QueueIndex::new()
        }
    }
}

fn write_index(store: &dyn PersistentStore, index: &QueueIndex) -> Result<(), QueueError> {
    if index.is_empty() {
        store.remove(QUEUE_INDEX_KEY)?;
        return Ok(());
    }
    let raw = serde_json::to_string(index).map_err(crate::serializer::SerializeError::from)?;
    store.set(QUEUE_INDEX_KEY, &raw)?;
    Ok(())
}

/// Write the record and append its id to the queue index. Re-persisting an
/// already-indexed record (retry count updates) leaves its slot untouched.
pub fn persist(
    store: &dyn PersistentStore,
    registry: &SerializerRegistry,
    request: &QueuedRequest,
) -> Result<(), QueueError> {
    let raw = request.to_record(registry)?;
    store.set(&record_key(&request.id), &raw)?;
    let mut index = read_index(store);
    let ids = index.entry(request.queue.clone()).or_default();
    if !ids.iter().any(|id| *id == request.id) {
        ids.push(request.id.clone());
    }
    write_index(store, &index)?;
    Ok(())
}

/// Delete the record and strike its id from the index. Empty queues and an
/// empty index leave no litter behind.
pub fn remove(store: &dyn PersistentStore, queue: &str, id: &str) -> Result<(), QueueError> {
    store.remove(&record_key(id))?;
    let mut index = read_index(store);
    if let Some(ids) = index.get_mut(queue) {
        ids.retain(|existing| existing != id);
        if ids.is_empty() {
            index.remove(queue);
        }
    }
    write_index(store, &index)?;
    Ok(())
}

/// Substitute the record at the same index position (queue item updated or
/// re-derived without changing its execution slot).
pub fn replace(
    store: &dyn PersistentStore,
    registry: &SerializerRegistry,
    queue: &str,
    old_id: &str,
    request: &QueuedRequest,
) -> Result<(), QueueError> {
    let raw = request.to_record(registry)?;
    store.set(&record_key(&request.id), &raw)?;
    let mut index = read_index(store);
    let ids = index.entry(queue.to_string()).or_default();
    match ids.iter().position(|id| id == old_id) {
        Some(pos) => ids[pos] = request.id.clone(),
        None => ids.push(request.id.clone()),
    }
    write_index(store, &index)?;
    if old_id != request.id {
        store.remove(&record_key(old_id))?;
    }
    Ok(())
}

/// Full reconstruction on startup. Idempotent and self-healing: index
/// entries without a record are discarded, records without an index
/// reference are discarded, and the repaired index is written back.
pub fn load_queues(
    store: &dyn PersistentStore,
    registry: &SerializerRegistry,
) -> Result<BTreeMap<String, Vec<QueuedRequest>>, QueueError> {
    let mut index = read_index(store);
    let mut queues = BTreeMap::new();
    let mut referenced: BTreeSet<String> = BTreeSet::new();
    let mut healed = false;

    for (queue, ids) in &mut index {
        let mut restored = Vec::with_capacity(ids.len());
        let mut kept = Vec::with_capacity(ids.len());
        for id in ids.iter() {
            match store.get(&record_key(id)) {
                Ok(Some(raw)) => match QueuedRequest::from_record(registry, &raw) {
                    Ok(request) => {
                        referenced.insert(record_key(id));
                        kept.push(id.clone());
                        restored.push(request);
                    }
                    Err(e) => {
                        warn!(queue = %queue, id = %id, "discarding unreadable queue record: {e}");
                        let _ = store.remove(&record_key(id));
                        healed = true;
                    }
                },
                Ok(None) => {
                    warn!(queue = %queue, id = %id, "discarding index entry with missing record");
                    healed = true;
                }
                Err(e) => {
                    warn!(queue = %queue, id = %id, "record load failed, keeping index entry: {e}");
                    kept.push(id.clone());
                }
            }
        }
        if kept.len() != ids.len() {
            *ids = kept;
        }
        if !restored.is_empty() {
            queues.insert(queue.clone(), restored);
        }
    }
    index.retain(|_, ids| !ids.is_empty());

    // Orphan records: present in storage, referenced by no queue.
    if let Ok(keys) = store.keys_with_prefix(RECORD_KEY_PREFIX) {
        for key in keys {
            if key == QUEUE_INDEX_KEY || referenced.contains(&key) {
                continue;
            }
            warn!(key = %key, "discarding orphan queue record");
            let _ = store.remove(&key);
        }
    }

    if healed {
        write_index(store, &index)?;
    }
    Ok(queues)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{Backoff, RetryMatcher};
    use crate::storage::MemoryStore;
    use crate::vdata::virtualize;

    fn registry() -> SerializerRegistry {
        SerializerRegistry::new()
    }

    fn sample(queue: &str) -> QueuedRequest {
        let vresp = virtualize(Value::object([("id", Value::Undefined)]));
        QueuedRequest::new(
            queue,
            Behavior::Durable,
            RequestDescriptor::new("POST", "/items").with_body(Value::object([(
                "title",
                Value::from("draft"),
            )])),
            RetryPolicy::new(RetryMatcher::Any, 2, Backoff::fixed(100)),
            Value::array([Value::from("arg0")]),
            Some(vresp),
        )
    }

    #[test]
    fn record_round_trip_preserves_identity() {
        let reg = registry();
        let request = sample("q");
        let raw = request.to_record(&reg).unwrap();
        let restored = QueuedRequest::from_record(&reg, &raw).unwrap();
        assert_eq!(restored.id, request.id);
        assert_eq!(restored.queue, "q");
        assert_eq!(restored.behavior, Behavior::Durable);
        assert_eq!(restored.vdata_ids, request.vdata_ids);
        assert_eq!(restored.retry.max_retries, 2);
        assert_eq!(restored.status, Status::Pending);
        assert_eq!(restored.entity.method, "POST");
    }

    #[test]
    fn persist_then_load_round_trips_order() {
        let store = MemoryStore::new();
        let reg = registry();
        let a = sample("q");
        let b = sample("q");
        persist(&store, &reg, &a).unwrap();
        persist(&store, &reg, &b).unwrap();

        let queues = load_queues(&store, &reg).unwrap();
        let ids: Vec<&str> = queues["q"].iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec![a.id.as_str(), b.id.as_str()]);

        // idempotent
        let queues2 = load_queues(&store, &reg).unwrap();
        assert_eq!(queues2["q"].len(), 2);
    }

    #[test]
    fn repersist_keeps_slot_and_updates_retry_count() {
        let store = MemoryStore::new();
        let reg = registry();
        let a = sample("q");
        let mut b = sample("q");
        persist(&store, &reg, &a).unwrap();
        persist(&store, &reg, &b).unwrap();

        b.retry_count = 2;
        persist(&store, &reg, &b).unwrap();

        let queues = load_queues(&store, &reg).unwrap();
        assert_eq!(queues["q"].len(), 2);
        assert_eq!(queues["q"][1].id, b.id);
        assert_eq!(queues["q"][1].retry_count, 2);
    }

    #[test]
    fn remove_clears_empty_queue_and_index() {
        let store = MemoryStore::new();
        let reg = registry();
        let a = sample("q");
        persist(&store, &reg, &a).unwrap();

        remove(&store, "q", &a.id).unwrap();
        assert!(store.get(&record_key(&a.id)).unwrap().is_none());
        assert!(store.get(QUEUE_INDEX_KEY).unwrap().is_none());
    }

    #[test]
    fn replace_keeps_position() {
        let store = MemoryStore::new();
        let reg = registry();
        let a = sample("q");
        let b = sample("q");
        let c = sample("q");
        persist(&store, &reg, &a).unwrap();
        persist(&store, &reg, &b).unwrap();
        persist(&store, &reg, &c).unwrap();

        let replacement = sample("q");
        replace(&store, &reg, "q", &b.id, &replacement).unwrap();

        let queues = load_queues(&store, &reg).unwrap();
        let ids: Vec<&str> = queues["q"].iter().map(|r| r.id.as_str()).collect();
        assert_eq!(
            ids,
            vec![a.id.as_str(), replacement.id.as_str(), c.id.as_str()]
        );
        assert!(store.get(&record_key(&b.id)).unwrap().is_none());
    }

    #[test]
    fn load_heals_missing_record() {
        let store = MemoryStore::new();
        let reg = registry();
        let a = sample("q");
        let b = sample("q");
        persist(&store, &reg, &a).unwrap();
        persist(&store, &reg, &b).unwrap();

        // simulate the record write being lost
        store.remove(&record_key(&a.id)).unwrap();

        let queues = load_queues(&store, &reg).unwrap();
        let ids: Vec<&str> = queues["q"].iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec![b.id.as_str()]);

        // the healed index no longer mentions the lost id
        let raw = store.get(QUEUE_INDEX_KEY).unwrap().unwrap();
        assert!(!raw.contains(&a.id));
    }

    #[test]
    fn load_heals_orphan_record() {
        let store = MemoryStore::new();
        let reg = registry();
        let a = sample("q");
        persist(&store, &reg, &a).unwrap();

        // simulate the index write being lost
        store.remove(QUEUE_INDEX_KEY).unwrap();

        let queues = load_queues(&store, &reg).unwrap();
        assert!(queues.is_empty());
        assert!(store.get(&record_key(&a.id)).unwrap().is_none());
    }
}
