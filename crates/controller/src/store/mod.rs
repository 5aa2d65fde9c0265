//! Resource store abstraction.
//!
//! The store is an external collaborator: Warden only needs get/list/watch,
//! status writes with optimistic concurrency, and a merge-patch flavoured
//! apply for status. [`MemoryStore`] implements it for tests and for
//! single-process deployments; [`Api`] is the typed view controllers use.

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use serde_json::Value;
use std::marker::PhantomData;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

use warden_common::{Classify, ErrorClass, ObjectKey};

use crate::api::{HasStatus, ObjectMeta, Resource};

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(ObjectKey),

    #[error("{0} already exists")]
    AlreadyExists(ObjectKey),

    #[error("conflict writing {key}: stored version {current}, given {given}")]
    Conflict {
        key: ObjectKey,
        current: u64,
        given: u64,
    },

    #[error("malformed {kind} object: {source}")]
    Malformed {
        kind: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

impl Classify for StoreError {
    fn class(&self) -> ErrorClass {
        match self {
            StoreError::Malformed { .. } => ErrorClass::Configuration,
            _ => ErrorClass::Transient,
        }
    }

    fn reason(&self) -> &'static str {
        match self {
            StoreError::NotFound(_) => "NotFound",
            StoreError::AlreadyExists(_) => "AlreadyExists",
            StoreError::Conflict { .. } => "Conflict",
            StoreError::Malformed { .. } => "MalformedObject",
            StoreError::Unavailable(_) => "StoreUnavailable",
        }
    }
}

// ============================================================================
// Watch events
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventType {
    Added,
    Modified,
    Deleted,
}

/// Change notification. Controllers re-read the object; the event carries
/// only identity and the owner, so owners can be enqueued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub event_type: WatchEventType,
    pub key: ObjectKey,
    pub owner: Option<ObjectKey>,
}

// ============================================================================
// Store trait
// ============================================================================

/// Untyped object storage. Objects are JSON documents with a `metadata`
/// field and, for most kinds, `spec` and `status`.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    async fn get(&self, key: &ObjectKey) -> Result<Option<Value>, StoreError>;

    /// All objects of `kind`, optionally restricted to one namespace.
    async fn list(&self, kind: &str, namespace: Option<&str>) -> Result<Vec<Value>, StoreError>;

    /// Fails with `AlreadyExists` when the key is taken.
    async fn create(&self, kind: &str, object: Value) -> Result<Value, StoreError>;

    /// Replace metadata and spec. Status in `object` is ignored.
    async fn update(&self, kind: &str, object: Value) -> Result<Value, StoreError>;

    /// Replace status only, guarded by the resource version.
    async fn update_status(&self, kind: &str, object: Value) -> Result<Value, StoreError>;

    /// Merge `status` into the stored status. A `null` field removes it.
    async fn apply_status(
        &self,
        key: &ObjectKey,
        status: Value,
        field_manager: &str,
    ) -> Result<Value, StoreError>;

    /// Delete, or mark for deletion while finalizers remain.
    async fn delete(&self, key: &ObjectKey) -> Result<(), StoreError>;

    fn watch(&self) -> broadcast::Receiver<WatchEvent>;
}

// ============================================================================
// Typed access
// ============================================================================

/// Typed view of one resource kind.
pub struct Api<K> {
    store: Arc<dyn ResourceStore>,
    _kind: PhantomData<fn() -> K>,
}

impl<K> Clone for Api<K> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            _kind: PhantomData,
        }
    }
}

fn decode<K: Resource>(value: Value) -> Result<K, StoreError> {
    serde_json::from_value(value).map_err(|source| StoreError::Malformed {
        kind: K::KIND.to_string(),
        source,
    })
}

fn encode<K: Resource>(object: &K) -> Result<Value, StoreError> {
    serde_json::to_value(object).map_err(|source| StoreError::Malformed {
        kind: K::KIND.to_string(),
        source,
    })
}

impl<K: Resource> Api<K> {
    pub fn new(store: Arc<dyn ResourceStore>) -> Self {
        Self {
            store,
            _kind: PhantomData,
        }
    }

    pub fn key(namespace: &str, name: &str) -> ObjectKey {
        ObjectKey::new(K::KIND, namespace, name)
    }

    pub async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>, StoreError> {
        self.get_key(&Self::key(namespace, name)).await
    }

    pub async fn get_key(&self, key: &ObjectKey) -> Result<Option<K>, StoreError> {
        self.store.get(key).await?.map(decode).transpose()
    }

    pub async fn list(&self, namespace: Option<&str>) -> Result<Vec<K>, StoreError> {
        self.store
            .list(K::KIND, namespace)
            .await?
            .into_iter()
            .map(decode)
            .collect()
    }

    /// Objects whose owner is `owner`.
    pub async fn list_owned(&self, owner: &ObjectKey) -> Result<Vec<K>, StoreError> {
        let objects = self.list(Some(&owner.namespace)).await?;
        Ok(objects
            .into_iter()
            .filter(|o| o.meta().owner.as_ref() == Some(owner))
            .collect())
    }

    pub async fn create(&self, object: &K) -> Result<K, StoreError> {
        decode(self.store.create(K::KIND, encode(object)?).await?)
    }

    pub async fn update(&self, object: &K) -> Result<K, StoreError> {
        decode(self.store.update(K::KIND, encode(object)?).await?)
    }

    pub async fn delete(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        self.store.delete(&Self::key(namespace, name)).await
    }

    /// Delete, treating an already-absent object as success.
    pub async fn delete_if_exists(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        match self.delete(namespace, name).await {
            Err(StoreError::NotFound(_)) => Ok(()),
            other => other,
        }
    }
}

impl<K: HasStatus> Api<K> {
    pub async fn update_status(&self, object: &K) -> Result<K, StoreError> {
        decode(self.store.update_status(K::KIND, encode(object)?).await?)
    }

    /// Apply the given status fields under `field_manager`.
    pub async fn apply_status(
        &self,
        key: &ObjectKey,
        status: Value,
        field_manager: &str,
    ) -> Result<K, StoreError> {
        decode(self.store.apply_status(key, status, field_manager).await?)
    }
}

/// Read the metadata of an untyped object.
pub(crate) fn object_meta(value: &Value) -> Result<ObjectMeta, serde_json::Error> {
    serde_json::from_value(value.get("metadata").cloned().unwrap_or(Value::Null))
}
