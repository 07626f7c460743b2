//! Document Store Adapter (C2): typed CRUD plus atomic per-document field
//! updates over the collections named in spec.md §6.
//!
//! The trait itself is untyped (`serde_json::Value`) so it stays
//! object-safe — every concrete document type lives in its owning crate
//! (`ledger::PipelineRun`, `pending_input::PendingInput`, ...) and this crate
//! has no dependency on any of them. [`get_as`], [`create_as`], and
//! [`put_as`] are the typed convenience wrappers every caller actually uses.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::RwLock;

use crate::Error;

/// Well-known collection names (spec.md §6). Collections that are
/// conceptually per-user (`users/<id>/pipeline_runs`, ...) are modeled as a
/// flat collection whose document id is prefixed with the user id, since
/// the in-memory and most document-store backends have no native concept of
/// subcollections.
pub mod collections {
    /// Top-level user records.
    pub const USERS: &str = "users";
    /// `PipelineRun` ledger entries, id = `pipeline_execution_id`.
    pub const PIPELINE_RUNS: &str = "pipeline_runs";
    /// Per-`(run_id, destination)` delivery rows, updated independently of
    /// the owning `PipelineRun` document (spec.md §4.7).
    pub const PIPELINE_RUN_DESTINATIONS: &str = "pipeline_run_destinations";
    /// `PendingInput` suspension points.
    pub const PENDING_INPUTS: &str = "pending_inputs";
    /// `ExecutionRecord` audit rows.
    pub const EXECUTIONS: &str = "executions";
    /// `UploadedActivityRecord` loop-prevention rows.
    pub const UPLOADED_ACTIVITIES: &str = "uploaded_activities";
    /// Per-user, per-destination default plugin configuration.
    pub const PLUGIN_DEFAULTS: &str = "plugin_defaults";
    /// Monotonic counters (e.g. for id allocation).
    pub const COUNTERS: &str = "counters";
    /// Personal-record tracking rows.
    pub const PERSONAL_RECORDS: &str = "personal_records";
    /// Publicly showcased activities.
    pub const SHOWCASED_ACTIVITIES: &str = "showcased_activities";
}

/// A document-store-backed collection of JSON documents with atomic
/// single-field updates.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Creates `id` in `collection` with `doc`. Fails with
    /// [`Error::AlreadyExists`] if a document with this id already exists.
    async fn create(&self, collection: &str, id: &str, doc: serde_json::Value) -> Result<(), Error>;

    /// Reads the document at `(collection, id)`.
    async fn get(&self, collection: &str, id: &str) -> Result<serde_json::Value, Error>;

    /// Replaces the whole document at `(collection, id)`, creating it if
    /// absent.
    async fn put(&self, collection: &str, id: &str, doc: serde_json::Value) -> Result<(), Error>;

    /// Atomically sets a single top-level field on an existing document.
    /// Fails with [`Error::NotFound`] if the document doesn't exist yet.
    async fn update_field(
        &self,
        collection: &str,
        id: &str,
        field: &str,
        value: serde_json::Value,
    ) -> Result<(), Error>;

    /// Returns every `(id, doc)` pair currently stored in `collection`, for
    /// callers that need to filter by value (e.g. the dedup gate scanning
    /// for an existing successful run). Backed implementations with native
    /// query support should prefer a narrower query where one exists; this
    /// is the fallback every backend must support.
    async fn scan(&self, collection: &str) -> Result<Vec<(String, serde_json::Value)>, Error>;
}

/// Reads and deserializes the document at `(collection, id)`.
pub async fn get_as<T: DeserializeOwned>(
    store: &dyn DocumentStore,
    collection: &str,
    id: &str,
) -> Result<T, Error> {
    let value = store.get(collection, id).await?;
    serde_json::from_value(value).map_err(|err| Error::Corrupt {
        uri: format!("{collection}/{id}"),
        message: err.to_string(),
    })
}

/// Serializes `doc` and creates it at `(collection, id)`.
pub async fn create_as<T: Serialize + Sync>(
    store: &dyn DocumentStore,
    collection: &str,
    id: &str,
    doc: &T,
) -> Result<(), Error> {
    let value = serde_json::to_value(doc).map_err(|err| Error::Corrupt {
        uri: format!("{collection}/{id}"),
        message: err.to_string(),
    })?;
    store.create(collection, id, value).await
}

/// Serializes `doc` and replaces it at `(collection, id)`.
pub async fn put_as<T: Serialize + Sync>(
    store: &dyn DocumentStore,
    collection: &str,
    id: &str,
    doc: &T,
) -> Result<(), Error> {
    let value = serde_json::to_value(doc).map_err(|err| Error::Corrupt {
        uri: format!("{collection}/{id}"),
        message: err.to_string(),
    })?;
    store.put(collection, id, value).await
}

/// Scans `collection` and deserializes every document, skipping (and
/// logging) any that fail to decode rather than failing the whole scan.
pub async fn scan_as<T: DeserializeOwned>(store: &dyn DocumentStore, collection: &str) -> Result<Vec<(String, T)>, Error> {
    let raw = store.scan(collection).await?;
    let mut decoded = Vec::with_capacity(raw.len());
    for (id, value) in raw {
        match serde_json::from_value::<T>(value) {
            Ok(doc) => decoded.push((id, doc)),
            Err(err) => {
                tracing::warn!(collection, id, error = %err, "skipping undecodable document during scan");
            }
        }
    }
    Ok(decoded)
}

/// An in-memory [`DocumentStore`] used by tests and single-process
/// deployments. Collections are created on first write.
#[derive(Default)]
pub struct InMemoryDocumentStore {
    collections: Arc<RwLock<HashMap<String, HashMap<String, serde_json::Value>>>>,
}

impl InMemoryDocumentStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn create(&self, collection: &str, id: &str, doc: serde_json::Value) -> Result<(), Error> {
        let mut collections = self.collections.write().await;
        let docs = collections.entry(collection.to_string()).or_default();
        if docs.contains_key(id) {
            return Err(Error::AlreadyExists {
                uri: format!("{collection}/{id}"),
            });
        }
        let _ = docs.insert(id.to_string(), doc);
        Ok(())
    }

    async fn get(&self, collection: &str, id: &str) -> Result<serde_json::Value, Error> {
        let collections = self.collections.read().await;
        collections
            .get(collection)
            .and_then(|docs| docs.get(id))
            .cloned()
            .ok_or_else(|| Error::NotFound {
                uri: format!("{collection}/{id}"),
            })
    }

    async fn put(&self, collection: &str, id: &str, doc: serde_json::Value) -> Result<(), Error> {
        let mut collections = self.collections.write().await;
        let docs = collections.entry(collection.to_string()).or_default();
        let _ = docs.insert(id.to_string(), doc);
        Ok(())
    }

    async fn update_field(
        &self,
        collection: &str,
        id: &str,
        field: &str,
        value: serde_json::Value,
    ) -> Result<(), Error> {
        let mut collections = self.collections.write().await;
        let docs = collections
            .get_mut(collection)
            .ok_or_else(|| Error::NotFound {
                uri: format!("{collection}/{id}"),
            })?;
        let doc = docs.get_mut(id).ok_or_else(|| Error::NotFound {
            uri: format!("{collection}/{id}"),
        })?;
        match doc {
            serde_json::Value::Object(map) => {
                let _ = map.insert(field.to_string(), value);
                Ok(())
            }
            _ => Err(Error::Corrupt {
                uri: format!("{collection}/{id}"),
                message: "document is not a JSON object".to_string(),
            }),
        }
    }

    async fn scan(&self, collection: &str) -> Result<Vec<(String, serde_json::Value)>, Error> {
        let collections = self.collections.read().await;
        Ok(collections
            .get(collection)
            .map(|docs| docs.iter().map(|(id, v)| (id.clone(), v.clone())).collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod test {
    use serde::Deserialize;

    use super::*;

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Widget {
        name: String,
        count: u32,
    }

    #[tokio::test]
    async fn create_then_get_round_trips_typed() {
        let store = InMemoryDocumentStore::new();
        let widget = Widget {
            name: "gear".into(),
            count: 3,
        };
        create_as(&store, "widgets", "w1", &widget).await.unwrap();

        let loaded: Widget = get_as(&store, "widgets", "w1").await.unwrap();
        assert_eq!(loaded, widget);
    }

    #[tokio::test]
    async fn create_twice_is_rejected() {
        let store = InMemoryDocumentStore::new();
        store.create("widgets", "w1", serde_json::json!({"count": 1})).await.unwrap();

        let second = store.create("widgets", "w1", serde_json::json!({"count": 2})).await;
        assert!(matches!(second, Err(Error::AlreadyExists { .. })));
    }

    #[tokio::test]
    async fn update_field_mutates_single_key() {
        let store = InMemoryDocumentStore::new();
        store
            .create("widgets", "w1", serde_json::json!({"count": 1, "name": "gear"}))
            .await
            .unwrap();

        store.update_field("widgets", "w1", "count", serde_json::json!(2)).await.unwrap();

        let doc = store.get("widgets", "w1").await.unwrap();
        assert_eq!(doc["count"], serde_json::json!(2));
        assert_eq!(doc["name"], serde_json::json!("gear"));
    }

    #[tokio::test]
    async fn update_field_on_missing_document_is_not_found() {
        let store = InMemoryDocumentStore::new();
        let result = store.update_field("widgets", "missing", "count", serde_json::json!(1)).await;
        assert!(matches!(result, Err(Error::NotFound { .. })));
    }

    #[tokio::test]
    async fn scan_returns_every_document_in_collection() {
        let store = InMemoryDocumentStore::new();
        store.create("widgets", "w1", serde_json::json!({"count": 1})).await.unwrap();
        store.create("widgets", "w2", serde_json::json!({"count": 2})).await.unwrap();

        let all = store.scan("widgets").await.unwrap();
        assert_eq!(all.len(), 2);
    }
}
