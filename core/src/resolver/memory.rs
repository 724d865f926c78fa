use std::collections::BTreeMap;
use std::sync::Mutex;

use serde_json::Value;

use super::{CollectionService, ServiceError};

/// In-process collection service holding every collection in memory.
///
/// Records each write so callers can inspect the exact payloads that were sent, and can be told
/// to fail reads or writes.
#[derive(Default)]
pub struct MemoryCollectionService {
    collections: Mutex<BTreeMap<String, Vec<Value>>>,
    set_calls: Mutex<Vec<(String, i32, Vec<Value>)>>,
    fail_get: Mutex<Option<String>>,
    fail_set: Mutex<Option<String>>,
}

impl MemoryCollectionService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an element without going through a write.
    pub fn insert(&self, collection: &str, item: Value) {
        self.collections
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(collection.to_string())
            .or_default()
            .push(item);
    }

    pub fn items(&self, collection: &str) -> Vec<Value> {
        self.collections
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    pub fn set_calls(&self) -> Vec<(String, i32, Vec<Value>)> {
        self.set_calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn fail_reads(&self, reason: Option<&str>) {
        *self.fail_get.lock().unwrap_or_else(|e| e.into_inner()) = reason.map(str::to_string);
    }

    pub fn fail_writes(&self, reason: Option<&str>) {
        *self.fail_set.lock().unwrap_or_else(|e| e.into_inner()) = reason.map(str::to_string);
    }
}

fn ifindex_of(item: &Value) -> Option<i64> {
    item.get("ifindex").and_then(Value::as_i64)
}

impl CollectionService for MemoryCollectionService {
    fn get_collection(&self, collection: &str) -> Result<Vec<Value>, ServiceError> {
        if let Some(reason) = self.fail_get.lock().unwrap_or_else(|e| e.into_inner()).clone() {
            return Err(ServiceError::Unreachable(reason));
        }
        Ok(self.items(collection))
    }

    fn set_collection(
        &self,
        collection: &str,
        ifindex: i32,
        items: Vec<Value>,
    ) -> Result<(), ServiceError> {
        if let Some(reason) = self.fail_set.lock().unwrap_or_else(|e| e.into_inner()).clone() {
            return Err(ServiceError::Rejected(reason));
        }
        if let Some(stray) = items
            .iter()
            .find(|item| ifindex_of(item) != Some(i64::from(ifindex)))
        {
            return Err(ServiceError::Rejected(format!(
                "element {stray} is not scoped to interface {ifindex}"
            )));
        }

        self.set_calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((collection.to_string(), ifindex, items.clone()));

        let mut collections = self.collections.lock().unwrap_or_else(|e| e.into_inner());
        let stored = collections.entry(collection.to_string()).or_default();
        stored.retain(|item| ifindex_of(item) != Some(i64::from(ifindex)));
        stored.extend(items);
        Ok(())
    }
}
