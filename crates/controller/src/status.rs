//! Status persistence.
//!
//! A pass works on a clone of the object and hands both versions here. The
//! status is written only when it differs, using the strategy chosen in
//! configuration:
//!
//! - `Update` replaces the status subresource. A version conflict is
//!   retried against a fresh read, re-applying this pass's status.
//! - `Apply` sends only the fields this pass changed, under the field
//!   manager, so fields written by others are left alone.

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, trace};

use warden_config::StatusWriteStrategy;

use crate::api::{HasStatus, Resource};
use crate::store::{Api, StoreError};

const MAX_CONFLICT_RETRIES: usize = 3;

#[derive(Debug, Clone)]
pub struct StatusWriter {
    strategy: StatusWriteStrategy,
    field_manager: String,
}

impl StatusWriter {
    pub fn new(strategy: StatusWriteStrategy, field_manager: impl Into<String>) -> Self {
        Self {
            strategy,
            field_manager: field_manager.into(),
        }
    }

    pub fn strategy(&self) -> StatusWriteStrategy {
        self.strategy
    }

    /// Persist `updated`'s status if it differs from `original`'s.
    ///
    /// Returns `true` when a write was made.
    pub async fn write<K: HasStatus>(
        &self,
        api: &Api<K>,
        original: &K,
        updated: &K,
    ) -> Result<bool, StoreError> {
        if original.status() == updated.status() {
            trace!(key = %updated.key(), "Status unchanged, skipping write");
            return Ok(false);
        }

        match self.strategy {
            StatusWriteStrategy::Update => self.update(api, updated).await?,
            StatusWriteStrategy::Apply => {
                let patch = status_patch(K::KIND, original.status(), updated.status())?;
                api.apply_status(&updated.key(), patch, &self.field_manager)
                    .await?;
            }
        }

        debug!(key = %updated.key(), strategy = ?self.strategy, "Status written");
        Ok(true)
    }

    async fn update<K: HasStatus>(&self, api: &Api<K>, updated: &K) -> Result<(), StoreError> {
        let mut target = updated.clone();
        let mut attempt = 0;

        loop {
            match api.update_status(&target).await {
                Ok(_) => return Ok(()),
                Err(e) if e.is_conflict() && attempt < MAX_CONFLICT_RETRIES => {
                    attempt += 1;
                    debug!(key = %updated.key(), attempt, "Status conflict, retrying with fresh read");
                    let key = updated.key();
                    let Some(latest) = api.get_key(&key).await? else {
                        return Err(StoreError::NotFound(key));
                    };
                    target = latest;
                    *target.status_mut() = updated.status().clone();
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Fields of `new` that differ from `old`; fields dropped in `new` become `null`.
fn status_patch<S: Serialize>(kind: &str, old: &S, new: &S) -> Result<Value, StoreError> {
    let malformed = |source| StoreError::Malformed {
        kind: kind.to_string(),
        source,
    };
    let old = serde_json::to_value(old).map_err(malformed)?;
    let new = serde_json::to_value(new).map_err(malformed)?;

    let empty = Map::new();
    let old_fields = old.as_object().unwrap_or(&empty);
    let new_fields = new.as_object().unwrap_or(&empty);

    let mut patch = Map::new();
    for (field, value) in new_fields {
        if old_fields.get(field) != Some(value) {
            patch.insert(field.clone(), value.clone());
        }
    }
    for field in old_fields.keys() {
        if !new_fields.contains_key(field) {
            patch.insert(field.clone(), Value::Null);
        }
    }

    Ok(Value::Object(patch))
}
