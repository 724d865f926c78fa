//! Client side of the remote collection service that owns resolver configuration.
//!
//! The service only understands whole collections: a read returns every element of a named
//! collection across all interface indexes, and a write replaces every element that belongs to
//! one interface index. Each element is a JSON object carrying at least an `ifindex` field.

pub mod http;
pub mod memory;

use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

pub use http::HttpCollectionService;
pub use memory::MemoryCollectionService;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("collection service unreachable: {0}")]
    Unreachable(String),
    #[error("collection service rejected the request: {0}")]
    Rejected(String),
    #[error("malformed collection payload: {0}")]
    Payload(#[from] serde_json::Error),
}

pub trait CollectionService {
    fn get_collection(&self, collection: &str) -> Result<Vec<Value>, ServiceError>;

    /// Replace every element of `collection` scoped to `ifindex` with `items`.
    fn set_collection(
        &self,
        collection: &str,
        ifindex: i32,
        items: Vec<Value>,
    ) -> Result<(), ServiceError>;
}

/// Typed view over one named collection.
pub struct CollectionProxy<'a, T> {
    service: &'a dyn CollectionService,
    collection: &'static str,
    _item: PhantomData<T>,
}

impl<'a, T> CollectionProxy<'a, T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new(service: &'a dyn CollectionService, collection: &'static str) -> Self {
        Self {
            service,
            collection,
            _item: PhantomData,
        }
    }

    pub fn collection(&self) -> &'static str {
        self.collection
    }

    pub fn get(&self) -> Result<Vec<T>, ServiceError> {
        let raw = self.service.get_collection(self.collection)?;
        let mut items = Vec::with_capacity(raw.len());
        for value in raw {
            items.push(serde_json::from_value(value)?);
        }
        Ok(items)
    }

    pub fn set(&self, ifindex: i32, items: &[T]) -> Result<(), ServiceError> {
        let mut payload = Vec::with_capacity(items.len());
        for item in items {
            payload.push(serde_json::to_value(item)?);
        }
        self.service
            .set_collection(self.collection, ifindex, payload)
    }
}
