#![deny(
    trivial_numeric_casts,
    missing_docs,
    unsafe_code,
    unstable_features,
    unused_import_braces,
    unused_qualifications,
    unused_extern_crates,
    unused_results
)]
#![warn(rust_2021_compatibility, unreachable_pub)]

//! Upload Workers (C13): opaque to the core (spec.md §1 non-goals exclude
//! destination-specific upload adapters), but the contract they settle
//! into the ledger and loop-prevention store is owned here. This crate
//! defines the [`UploadWorker`] trait an out-of-tree adapter implements,
//! plus [`UploadReporter`], the one place that turns an upload attempt
//! into a ledger row and an `UploadedActivityRecord` (spec.md §4.7, §4.8).

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ledger::Ledger;
use model::{Destination, EnrichedActivityEvent};
use store::bus::Envelope;
use store::document::DocumentStore;
use store::loop_prevention::{LoopPreventionStore, UploadedActivityRecord};
use thiserror::Error;

/// Errors raised while consuming an `upload-<destination>` envelope or
/// reporting its outcome.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The envelope payload did not decode as an `EnrichedActivityEvent`.
    #[error(transparent)]
    Store(#[from] store::Error),
    /// The ledger could not be updated.
    #[error(transparent)]
    Ledger(#[from] ledger::Error),
}

/// The outcome of one delivery attempt, as an upload adapter reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadStatus {
    /// The destination accepted the activity.
    Success,
    /// The destination rejected it or the attempt errored.
    Failed,
}

/// One upload attempt's result, as returned by [`UploadWorker::upload`].
#[derive(Debug, Clone)]
pub struct UploadAttempt {
    /// Whether the attempt succeeded.
    pub status: UploadStatus,
    /// The destination's id for the uploaded activity, set on SUCCESS.
    pub external_id: Option<String>,
    /// The failure message, set on FAILED.
    pub error: Option<String>,
}

impl UploadAttempt {
    /// Builds a SUCCESS attempt.
    pub fn success(external_id: impl Into<String>) -> Self {
        UploadAttempt {
            status: UploadStatus::Success,
            external_id: Some(external_id.into()),
            error: None,
        }
    }

    /// Builds a FAILED attempt.
    pub fn failed(error: impl Into<String>) -> Self {
        UploadAttempt {
            status: UploadStatus::Failed,
            external_id: None,
            error: Some(error.into()),
        }
    }
}

/// The interface an out-of-tree destination adapter implements. Each
/// instance owns one destination and is driven by a consumer subscribed to
/// that destination's `upload-<destination>` topic; the adapter itself may
/// call third-party APIs, handle auth, and retry internally — none of
/// which this crate knows about (spec.md §1 non-goals).
#[async_trait]
pub trait UploadWorker: Send + Sync {
    /// The destination this worker delivers to.
    fn destination(&self) -> Destination;

    /// Attempts to deliver `event` (create or update, per
    /// `event.use_update_method`).
    async fn upload(&self, event: &EnrichedActivityEvent) -> UploadAttempt;
}

/// Turns an [`UploadAttempt`] into a ledger settlement and, on success, a
/// loop-prevention record. This is the narrow surface the core exposes to
/// upload adapters; everything about the delivery itself is opaque.
pub struct UploadReporter {
    ledger: Ledger,
    loop_prevention: LoopPreventionStore,
}

impl UploadReporter {
    /// Wraps `document_store` for both the ledger and the loop-prevention
    /// store.
    pub fn new(document_store: Arc<dyn DocumentStore>) -> Self {
        Self {
            ledger: Ledger::new(document_store.clone()),
            loop_prevention: LoopPreventionStore::new(document_store),
        }
    }

    /// Settles `destination` on `run_id` per `attempt`, and on SUCCESS
    /// records an `UploadedActivityRecord` so the source's next webhook
    /// re-delivery of the same activity is recognised as a bounceback
    /// (spec.md §4.8). Loop-prevention recording is best-effort: a failure
    /// there is logged but does not change the reported outcome.
    pub async fn report(
        &self,
        run_id: &str,
        user_id: &str,
        source: &str,
        external_id: &str,
        destination: &Destination,
        attempt: UploadAttempt,
        now: DateTime<Utc>,
    ) -> Result<(), Error> {
        match attempt.status {
            UploadStatus::Success => {
                let destination_id = attempt.external_id.clone().unwrap_or_default();
                self.ledger
                    .settle_destination(
                        run_id,
                        destination,
                        model::DestinationStatus::Success,
                        attempt.external_id.clone(),
                        None,
                        now,
                    )
                    .await?;

                let record = UploadedActivityRecord {
                    id: String::new(),
                    user_id: user_id.to_string(),
                    source: source.to_string(),
                    external_id: external_id.to_string(),
                    destination: destination.to_string(),
                    destination_id,
                    uploaded_at: now,
                };
                if let Err(err) = self.loop_prevention.record_upload(record).await {
                    tracing::warn!(%run_id, %destination, error = %err, "loop-prevention record not written");
                }
            }
            UploadStatus::Failed => {
                self.ledger
                    .settle_destination(run_id, destination, model::DestinationStatus::Failed, None, attempt.error, now)
                    .await?;
            }
        }
        let _ = self.ledger.refresh_status(run_id, now).await?;
        Ok(())
    }
}

/// Decodes one `upload-<destination>` envelope, drives `worker`, and
/// reports the outcome through `reporter`. This is the body an
/// `engine::Worker` implementation for an upload consumer calls once per
/// received envelope.
pub async fn handle_envelope(worker: &dyn UploadWorker, reporter: &UploadReporter, envelope: &Envelope, now: DateTime<Utc>) -> Result<(), Error> {
    let event: EnrichedActivityEvent = store::bus::decode(envelope)?;
    let attempt = worker.upload(&event).await;
    reporter
        .report(
            &event.pipeline_execution_id,
            &event.activity.user_id,
            &event.activity.source,
            &event.activity.external_id,
            &worker.destination(),
            attempt,
            now,
        )
        .await
}
