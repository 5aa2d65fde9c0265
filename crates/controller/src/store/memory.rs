//! In-memory resource store with resource versions, finalizers and
//! owner-based cascading deletion.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::sync::broadcast;
use tracing::{debug, trace};

use warden_common::ObjectKey;

use super::{object_meta, ResourceStore, StoreError, WatchEvent, WatchEventType};

const WATCH_CAPACITY: usize = 1024;

/// In-memory store.
///
/// Every write bumps a store-wide resource version. Counters of status
/// writes are kept so tests can assert that unchanged passes write nothing.
pub struct MemoryStore {
    objects: RwLock<BTreeMap<ObjectKey, Value>>,
    version: AtomicU64,
    status_writes: AtomicUsize,
    events: broadcast::Sender<WatchEvent>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_CAPACITY);
        Self {
            objects: RwLock::new(BTreeMap::new()),
            version: AtomicU64::new(0),
            status_writes: AtomicUsize::new(0),
            events,
        }
    }

    /// Number of `update_status` and `apply_status` calls that succeeded.
    pub fn status_writes(&self) -> usize {
        self.status_writes.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    fn next_version(&self) -> u64 {
        self.version.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn notify(&self, event_type: WatchEventType, key: ObjectKey, object: &Value) {
        let owner = object_meta(object).ok().and_then(|m| m.owner);
        trace!(key = %key, event = ?event_type, "Store event");
        // No receivers is fine
        let _ = self.events.send(WatchEvent {
            event_type,
            key,
            owner,
        });
    }

    fn identify(kind: &str, object: &Value) -> Result<ObjectKey, StoreError> {
        let meta = object_meta(object).map_err(|source| StoreError::Malformed {
            kind: kind.to_string(),
            source,
        })?;
        Ok(ObjectKey::new(kind, meta.namespace, meta.name))
    }

    /// Remove `key` and, recursively, every object it owns. Dependents
    /// with finalizers are only marked for deletion.
    fn remove_cascading(
        &self,
        objects: &mut BTreeMap<ObjectKey, Value>,
        key: &ObjectKey,
    ) -> Vec<(WatchEventType, ObjectKey, Value)> {
        let mut events = Vec::new();
        let mut pending = vec![key.clone()];

        while let Some(current) = pending.pop() {
            if let Some(removed) = objects.remove(&current) {
                events.push((WatchEventType::Deleted, current.clone(), removed));
            }

            let dependents: Vec<ObjectKey> = objects
                .iter()
                .filter(|(_, v)| object_meta(v).ok().and_then(|m| m.owner).as_ref() == Some(&current))
                .map(|(k, _)| k.clone())
                .collect();

            for dependent in dependents {
                let Some(object) = objects.get_mut(&dependent) else {
                    continue;
                };
                let has_finalizers = object_meta(object).map(|m| !m.finalizers.is_empty()).unwrap_or(false);
                if has_finalizers {
                    let version = self.next_version();
                    set_meta_field(object, "deletionTimestamp", Value::String(Utc::now().to_rfc3339()));
                    set_meta_field(object, "resourceVersion", Value::from(version));
                    events.push((WatchEventType::Modified, dependent, object.clone()));
                } else {
                    pending.push(dependent);
                }
            }
        }

        events
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn set_meta_field(object: &mut Value, field: &str, value: Value) {
    if let Some(meta) = object.get_mut("metadata").and_then(Value::as_object_mut) {
        meta.insert(field.to_string(), value);
    }
}

fn meta_field(object: &Value, field: &str) -> Option<Value> {
    object.get("metadata").and_then(|m| m.get(field)).cloned()
}

fn stored_version(object: &Value) -> u64 {
    meta_field(object, "resourceVersion")
        .and_then(|v| v.as_u64())
        .unwrap_or(0)
}

fn merge_status(stored: &mut Value, patch: Value) {
    let status = stored
        .as_object_mut()
        .map(|o| o.entry("status").or_insert_with(|| Value::Object(Map::new())));
    let Some(Value::Object(status)) = status else {
        return;
    };
    if let Value::Object(fields) = patch {
        for (field, value) in fields {
            if value.is_null() {
                status.remove(&field);
            } else {
                status.insert(field, value);
            }
        }
    }
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn get(&self, key: &ObjectKey) -> Result<Option<Value>, StoreError> {
        Ok(self.objects.read().get(key).cloned())
    }

    async fn list(&self, kind: &str, namespace: Option<&str>) -> Result<Vec<Value>, StoreError> {
        Ok(self
            .objects
            .read()
            .iter()
            .filter(|(k, _)| k.kind == kind && namespace.is_none_or(|ns| k.namespace == ns))
            .map(|(_, v)| v.clone())
            .collect())
    }

    async fn create(&self, kind: &str, mut object: Value) -> Result<Value, StoreError> {
        let key = Self::identify(kind, &object)?;
        let created = {
            let mut objects = self.objects.write();
            if objects.contains_key(&key) {
                return Err(StoreError::AlreadyExists(key));
            }
            set_meta_field(&mut object, "resourceVersion", Value::from(self.next_version()));
            set_meta_field(&mut object, "generation", Value::from(1u64));
            set_meta_field(&mut object, "creationTimestamp", Value::String(Utc::now().to_rfc3339()));
            if let Some(meta) = object.get_mut("metadata").and_then(Value::as_object_mut) {
                meta.remove("deletionTimestamp");
            }
            objects.insert(key.clone(), object.clone());
            object
        };

        debug!(key = %key, "Created object");
        self.notify(WatchEventType::Added, key, &created);
        Ok(created)
    }

    async fn update(&self, kind: &str, mut object: Value) -> Result<Value, StoreError> {
        let key = Self::identify(kind, &object)?;
        let (event, result) = {
            let mut objects = self.objects.write();
            let stored = objects.get(&key).ok_or_else(|| StoreError::NotFound(key.clone()))?;

            let current = stored_version(stored);
            let given = stored_version(&object);
            if current != given {
                return Err(StoreError::Conflict { key, current, given });
            }

            let mut generation = meta_field(stored, "generation").and_then(|v| v.as_u64()).unwrap_or(1);
            if stored.get("spec") != object.get("spec") {
                generation += 1;
            }

            // Status, creation and deletion marks are store-owned
            let status = stored.get("status").cloned();
            let creation = meta_field(stored, "creationTimestamp");
            let deletion = meta_field(stored, "deletionTimestamp");
            if let Some(map) = object.as_object_mut() {
                match status {
                    Some(status) => {
                        map.insert("status".to_string(), status);
                    }
                    None => {
                        map.remove("status");
                    }
                }
            }
            set_meta_field(&mut object, "resourceVersion", Value::from(self.next_version()));
            set_meta_field(&mut object, "generation", Value::from(generation));
            if let Some(creation) = creation {
                set_meta_field(&mut object, "creationTimestamp", creation);
            }

            let finalizers_done = object_meta(&object).map(|m| m.finalizers.is_empty()).unwrap_or(false);
            match deletion {
                Some(_) if finalizers_done => {
                    let events = self.remove_cascading(&mut objects, &key);
                    (events, object)
                }
                Some(deletion) => {
                    set_meta_field(&mut object, "deletionTimestamp", deletion);
                    objects.insert(key.clone(), object.clone());
                    (vec![(WatchEventType::Modified, key.clone(), object.clone())], object)
                }
                None => {
                    objects.insert(key.clone(), object.clone());
                    (vec![(WatchEventType::Modified, key.clone(), object.clone())], object)
                }
            }
        };

        for (event_type, key, object) in event {
            self.notify(event_type, key, &object);
        }
        Ok(result)
    }

    async fn update_status(&self, kind: &str, object: Value) -> Result<Value, StoreError> {
        let key = Self::identify(kind, &object)?;
        let updated = {
            let mut objects = self.objects.write();
            let stored = objects.get_mut(&key).ok_or_else(|| StoreError::NotFound(key.clone()))?;

            let current = stored_version(stored);
            let given = stored_version(&object);
            if current != given {
                return Err(StoreError::Conflict { key, current, given });
            }

            if let Some(map) = stored.as_object_mut() {
                map.insert(
                    "status".to_string(),
                    object.get("status").cloned().unwrap_or(Value::Null),
                );
            }
            set_meta_field(stored, "resourceVersion", Value::from(self.next_version()));
            stored.clone()
        };

        self.status_writes.fetch_add(1, Ordering::SeqCst);
        self.notify(WatchEventType::Modified, key, &updated);
        Ok(updated)
    }

    async fn apply_status(
        &self,
        key: &ObjectKey,
        status: Value,
        field_manager: &str,
    ) -> Result<Value, StoreError> {
        let updated = {
            let mut objects = self.objects.write();
            let stored = objects.get_mut(key).ok_or_else(|| StoreError::NotFound(key.clone()))?;
            merge_status(stored, status);
            set_meta_field(stored, "resourceVersion", Value::from(self.next_version()));
            stored.clone()
        };

        trace!(key = %key, field_manager = field_manager, "Applied status");
        self.status_writes.fetch_add(1, Ordering::SeqCst);
        self.notify(WatchEventType::Modified, key.clone(), &updated);
        Ok(updated)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), StoreError> {
        let events = {
            let mut objects = self.objects.write();
            let stored = objects.get_mut(key).ok_or_else(|| StoreError::NotFound(key.clone()))?;

            let has_finalizers = object_meta(stored).map(|m| !m.finalizers.is_empty()).unwrap_or(false);
            if has_finalizers {
                if meta_field(stored, "deletionTimestamp").is_none() {
                    set_meta_field(stored, "deletionTimestamp", Value::String(Utc::now().to_rfc3339()));
                    set_meta_field(stored, "resourceVersion", Value::from(self.next_version()));
                }
                vec![(WatchEventType::Modified, key.clone(), stored.clone())]
            } else {
                self.remove_cascading(&mut objects, key)
            }
        };

        debug!(key = %key, "Deleted object");
        for (event_type, key, object) in events {
            self.notify(event_type, key, &object);
        }
        Ok(())
    }

    fn watch(&self) -> broadcast::Receiver<WatchEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(name: &str) -> Value {
        json!({
            "metadata": { "name": name, "namespace": "default" },
            "spec": { "dnsNames": ["example.com"] },
            "status": {}
        })
    }

    fn key(name: &str) -> ObjectKey {
        ObjectKey::new("Certificate", "default", name)
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let store = MemoryStore::new();
        let created = store.create("Certificate", object("web")).await.unwrap();
        assert_eq!(stored_version(&created), 1);

        let fetched = store.get(&key("web")).await.unwrap().unwrap();
        assert_eq!(fetched, created);

        let err = store.create("Certificate", object("web")).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_update_status_conflict() {
        let store = MemoryStore::new();
        let created = store.create("Certificate", object("web")).await.unwrap();

        let mut first = created.clone();
        first["status"] = json!({ "revision": 1 });
        store.update_status("Certificate", first).await.unwrap();

        let mut stale = created;
        stale["status"] = json!({ "revision": 2 });
        let err = store.update_status("Certificate", stale).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.status_writes(), 1);
    }

    #[tokio::test]
    async fn test_update_ignores_status_and_bumps_generation() {
        let store = MemoryStore::new();
        let mut created = store.create("Certificate", object("web")).await.unwrap();
        created["spec"] = json!({ "dnsNames": ["example.org"] });
        created["status"] = json!({ "revision": 9 });

        let updated = store.update("Certificate", created).await.unwrap();
        assert_eq!(updated["metadata"]["generation"], json!(2));
        assert_eq!(updated["status"], json!({}));
    }

    #[tokio::test]
    async fn test_apply_status_merges_fields() {
        let store = MemoryStore::new();
        let mut created = store.create("Certificate", object("web")).await.unwrap();
        created["status"] = json!({ "revision": 1, "notAfter": "2030-01-01T00:00:00Z" });
        store.update_status("Certificate", created).await.unwrap();

        let applied = store
            .apply_status(&key("web"), json!({ "revision": 2, "notAfter": null }), "warden")
            .await
            .unwrap();
        assert_eq!(applied["status"], json!({ "revision": 2 }));
    }

    #[tokio::test]
    async fn test_finalizer_delays_removal() {
        let store = MemoryStore::new();
        let mut obj = object("web");
        obj["metadata"]["finalizers"] = json!(["acme.warden.io/finalizer"]);
        store.create("Certificate", obj).await.unwrap();

        store.delete(&key("web")).await.unwrap();
        let marked = store.get(&key("web")).await.unwrap().unwrap();
        assert!(marked["metadata"]["deletionTimestamp"].is_string());

        let mut released = marked;
        released["metadata"]["finalizers"] = json!([]);
        store.update("Certificate", released).await.unwrap();
        assert!(store.get(&key("web")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cascading_delete_and_watch() {
        let store = MemoryStore::new();
        let mut watch = store.watch();

        store.create("Certificate", object("web")).await.unwrap();
        let mut child = object("web-1");
        child["metadata"]["owner"] = json!({ "kind": "Certificate", "namespace": "default", "name": "web" });
        store.create("CertificateRequest", child).await.unwrap();

        store.delete(&key("web")).await.unwrap();
        assert!(store.is_empty());

        let mut deleted = Vec::new();
        while let Ok(event) = watch.try_recv() {
            if event.event_type == WatchEventType::Deleted {
                deleted.push(event);
            }
        }
        assert_eq!(deleted.len(), 2);
        let child_event = deleted.iter().find(|e| e.key.kind == "CertificateRequest").unwrap();
        assert_eq!(child_event.owner, Some(key("web")));
    }
}
