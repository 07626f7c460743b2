//! Uploaded-Activity / Loop-Prevention Store (C4): records of
//! `(destination, destination_id)` previously uploaded by the engine, so
//! that a subsequent webhook re-ingest of the same activity (bounced back
//! through the destination) is recognised by the Deduplication Gate
//! (spec.md §4.2, §4.8).

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::document::{collections, get_as, put_as, scan_as, DocumentStore};
use crate::Error;

/// A record that the engine uploaded `external_id` (from `source`) to
/// `destination` as `destination_id`. Outlives the pipeline run.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct UploadedActivityRecord {
    /// `"<destination>:<destination_id>"`, the document id.
    pub id: String,
    /// The FitGlue user this upload belongs to.
    pub user_id: String,
    /// The source the original activity came from.
    pub source: String,
    /// The source's id for the original activity.
    pub external_id: String,
    /// The destination the activity was uploaded to.
    pub destination: String,
    /// The destination's id for the uploaded activity.
    pub destination_id: String,
    /// When the upload was recorded.
    pub uploaded_at: DateTime<Utc>,
}

/// Builds the loop-prevention document id for a destination/destination-id
/// pair (spec.md §3, §5 idempotency keys).
pub fn record_id(destination: &str, destination_id: &str) -> String {
    format!("{destination}:{destination_id}")
}

/// Thin wrapper over [`DocumentStore`] scoped to the
/// `uploaded_activities` collection.
pub struct LoopPreventionStore {
    store: Arc<dyn DocumentStore>,
}

impl LoopPreventionStore {
    /// Wraps `store`.
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Records that an upload happened. Idempotent: re-recording the same
    /// `(destination, destination_id)` overwrites with the latest
    /// `uploaded_at` rather than erroring, matching invariant 5 (two
    /// consecutive successful uploads of the same pair leave exactly one
    /// record). Call on every successful upload attempt, including no-op
    /// updates (spec.md §4.8); callers should treat a failure here as
    /// logged-but-non-fatal.
    pub async fn record_upload(&self, mut record: UploadedActivityRecord) -> Result<(), Error> {
        record.id = record_id(&record.destination, &record.destination_id);
        put_as(self.store.as_ref(), collections::UPLOADED_ACTIVITIES, &record.id.clone(), &record).await
    }

    /// Looks up the record for a `(destination, destination_id)` pair.
    pub async fn find_by_destination(
        &self,
        destination: &str,
        destination_id: &str,
    ) -> Result<Option<UploadedActivityRecord>, Error> {
        let id = record_id(destination, destination_id);
        match get_as::<UploadedActivityRecord>(self.store.as_ref(), collections::UPLOADED_ACTIVITIES, &id).await {
            Ok(record) => Ok(Some(record)),
            Err(Error::NotFound { .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Looks for an upload record matching `(user_id, source, external_id)`
    /// recorded within `window` of `now`, the bounceback suppression
    /// check of spec.md §4.2.
    pub async fn find_bounceback(
        &self,
        user_id: &str,
        source: &str,
        external_id: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<UploadedActivityRecord>, Error> {
        let all: Vec<(String, UploadedActivityRecord)> =
            scan_as(self.store.as_ref(), collections::UPLOADED_ACTIVITIES).await?;
        let cutoff = now - window;
        Ok(all
            .into_iter()
            .map(|(_, record)| record)
            .find(|record| {
                record.user_id == user_id
                    && record.source == source
                    && record.external_id == external_id
                    && record.uploaded_at >= cutoff
            }))
    }
}
