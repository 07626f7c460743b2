//! Blob Store Adapter (C1): read/write large JSON artifacts by URI.
//!
//! URIs follow `<scheme>://<bucket>/<path>` (spec.md §6). The store is
//! write-once per URI: a second `put` to the same URI is rejected, since
//! every reserved path embeds a `pipeline_execution_id` or equivalent
//! collision-avoiding key and is never meant to be overwritten in place.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::Error;

/// Reserved blob path builders (spec.md §6).
pub mod paths {
    /// `enriched_events/<user_id>/<pipeline_execution_id>.json`
    pub fn enriched_event(bucket: &str, user_id: &str, pipeline_execution_id: &str) -> String {
        format!("gs://{bucket}/enriched_events/{user_id}/{pipeline_execution_id}.json")
    }

    /// `original_payloads/<user_id>/<pipeline_execution_id>.json`
    pub fn original_payload(bucket: &str, user_id: &str, pipeline_execution_id: &str) -> String {
        format!("gs://{bucket}/original_payloads/{user_id}/{pipeline_execution_id}.json")
    }

    /// `showcase-assets/<pipeline_execution_id>/<asset-name>.<ext>`
    pub fn showcase_asset(bucket: &str, pipeline_execution_id: &str, asset_name: &str, ext: &str) -> String {
        format!("gs://{bucket}/showcase-assets/{pipeline_execution_id}/{asset_name}.{ext}")
    }

    /// `mobile_activities/<user_id>/<external_id>.json`
    pub fn mobile_activity(bucket: &str, user_id: &str, external_id: &str) -> String {
        format!("gs://{bucket}/mobile_activities/{user_id}/{external_id}.json")
    }

    /// `fit_files/<pipeline_execution_id>.fit`
    pub fn fit_file(bucket: &str, pipeline_execution_id: &str) -> String {
        format!("gs://{bucket}/fit_files/{pipeline_execution_id}.fit")
    }
}

/// Reads and writes opaque byte payloads keyed by URI.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Writes `bytes` to `uri`. Fails with [`Error::AlreadyExists`] if the
    /// URI has already been written (write-once).
    async fn put(&self, uri: &str, bytes: Vec<u8>) -> Result<(), Error>;

    /// Reads the bytes previously written to `uri`.
    async fn get(&self, uri: &str) -> Result<Vec<u8>, Error>;

    /// Returns whether `uri` has been written.
    async fn exists(&self, uri: &str) -> Result<bool, Error>;
}

/// An in-memory [`BlobStore`] used by tests and single-process deployments.
#[derive(Default)]
pub struct InMemoryBlobStore {
    objects: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl InMemoryBlobStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn put(&self, uri: &str, bytes: Vec<u8>) -> Result<(), Error> {
        let mut objects = self.objects.write().await;
        if objects.contains_key(uri) {
            return Err(Error::AlreadyExists { uri: uri.to_string() });
        }
        let _ = objects.insert(uri.to_string(), bytes);
        Ok(())
    }

    async fn get(&self, uri: &str) -> Result<Vec<u8>, Error> {
        let objects = self.objects.read().await;
        objects.get(uri).cloned().ok_or_else(|| Error::NotFound { uri: uri.to_string() })
    }

    async fn exists(&self, uri: &str) -> Result<bool, Error> {
        let objects = self.objects.read().await;
        Ok(objects.contains_key(uri))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let store = InMemoryBlobStore::new();
        store.put("gs://bucket/a.json", b"hello".to_vec()).await.unwrap();

        assert_eq!(store.get("gs://bucket/a.json").await.unwrap(), b"hello".to_vec());
        assert!(store.exists("gs://bucket/a.json").await.unwrap());
    }

    #[tokio::test]
    async fn put_twice_is_rejected() {
        let store = InMemoryBlobStore::new();
        store.put("gs://bucket/a.json", b"hello".to_vec()).await.unwrap();

        let second = store.put("gs://bucket/a.json", b"world".to_vec()).await;
        assert!(matches!(second, Err(Error::AlreadyExists { .. })));
    }

    #[tokio::test]
    async fn get_missing_is_not_found() {
        let store = InMemoryBlobStore::new();
        let result = store.get("gs://bucket/missing.json").await;
        assert!(matches!(result, Err(Error::NotFound { .. })));
    }
}
