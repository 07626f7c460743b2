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

//! Pending-Input Manager (C10): persists one suspension point per
//! `(source, external_id, provider_id)`, lets external callers (a user
//! answering a prompt, a background poller) resolve it, and republishes the
//! resume signal back onto the `pipeline-activity` topic for the Enricher
//! Orchestrator to pick up (spec.md §4.5).

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use model::EnrichedActivityEvent;
use serde::{Deserialize, Serialize};
use store::bus::{publish, topics, MessageBus};
use store::document::{collections, create_as, get_as, put_as, DocumentStore};
use thiserror::Error;

/// Errors raised by the pending-input manager.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// No pending input exists for the given id.
    #[error("pending input '{id}' not found")]
    NotFound {
        /// The id that was looked up.
        id: String,
    },

    /// A WAITING entry already exists under this id for a different
    /// suspending provider; the caller's id derivation is wrong, or two
    /// providers collided on the same `(source, external_id)`.
    #[error("pending input '{id}' is already waiting on provider '{existing_provider}'")]
    ProviderConflict {
        /// The pending input id.
        id: String,
        /// The provider currently holding the suspension.
        existing_provider: String,
    },

    /// The underlying store failed.
    #[error(transparent)]
    Store(#[from] store::Error),
}

/// Lifecycle of one suspension point.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PendingInputStatus {
    /// Waiting on a user or external system to supply `required_fields`.
    Waiting,
    /// Resolved; the resume signal has been published.
    Completed,
    /// Abandoned without ever being resolved.
    Cancelled,
}

/// Where the in-progress event this suspension belongs to can be found.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "snake_case")]
pub enum OriginalPayload {
    /// Stored inline, for small events below the offload threshold.
    Inline(EnrichedActivityEvent),
    /// Offloaded to the blob store at this URI.
    BlobUri(String),
}

/// A single suspension point raised by an `EnrichmentProvider` that cannot
/// complete without more information (spec.md §3, §4.3).
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PendingInput {
    /// Stable id, derived from `(source, external_id, enricher_provider_id)`
    /// via [`stable_id`].
    pub id: String,
    /// The owning user.
    pub user_id: String,
    /// The activity this suspension blocks.
    pub activity_id: String,
    /// The pipeline this suspension belongs to.
    pub pipeline_id: String,
    /// The run this suspension belongs to; re-published on resume so the
    /// Enricher Orchestrator re-enters the same `PipelineRun`.
    pub pipeline_execution_id: String,
    /// A related activity id, when the provider is disambiguating between
    /// two candidate activities (e.g. matching a strength session to its
    /// paired cardio session).
    pub linked_activity_id: Option<String>,
    /// The provider id that raised this suspension.
    pub enricher_provider_id: String,
    /// Field names the provider needs filled in before it can proceed.
    pub required_fields: Vec<String>,
    /// Current lifecycle status.
    pub status: PendingInputStatus,
    /// Set if a background poller (rather than a human) supplied the data.
    pub auto_populated: bool,
    /// Set if the user chose to let the pipeline proceed without
    /// resolving this suspension.
    pub continued_without_resolution: bool,
    /// When this suspension was created.
    pub created_at: DateTime<Utc>,
    /// When this suspension was completed, if it has been.
    pub completed_at: Option<DateTime<Utc>>,
    /// The field values supplied to resolve this suspension.
    pub input_data: HashMap<String, String>,
    /// Opaque metadata carried through for the UI, including any
    /// `display.*`-prefixed keys the provider attached (spec.md §4.5).
    pub metadata: HashMap<String, String>,
    /// Where to find the in-progress event to resume.
    pub original_payload: OriginalPayload,
}

/// Derives the stable id for a suspension raised by `provider_id` against
/// `(source, external_id)` (spec.md §4.3 step 2: "creates or updates").
pub fn stable_id(source: &str, external_id: &str, provider_id: &str) -> String {
    format!("{source}:{external_id}:{provider_id}")
}

/// Wraps a [`DocumentStore`] and [`MessageBus`] with the pending-input
/// read/write/resume contract.
pub struct PendingInputManager {
    store: Arc<dyn DocumentStore>,
    bus: Arc<dyn MessageBus>,
}

/// Published back onto `pipeline-activity` when a suspension is resolved,
/// telling the Enricher Orchestrator which provider to re-run and which
/// stored suspension triggered it (spec.md §4.3 resume behavior).
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ResumeSignal {
    /// The original run this resume re-enters.
    pub pipeline_execution_id: String,
    /// The pending input that was resolved.
    pub resume_pending_input_id: String,
    /// The single provider to re-run; every other provider's prior result
    /// is kept unchanged.
    pub resume_only_enrichers: Vec<String>,
}

impl PendingInputManager {
    /// Wraps `store` and `bus`.
    pub fn new(store: Arc<dyn DocumentStore>, bus: Arc<dyn MessageBus>) -> Self {
        Self { store, bus }
    }

    /// Creates a new suspension, or leaves an existing WAITING one with the
    /// same suspending provider untouched (idempotent re-delivery of the
    /// same provider's request). Fails with [`Error::ProviderConflict`] if a
    /// WAITING entry already exists under this id for a *different*
    /// provider, which would mean two providers collided on the same
    /// `(source, external_id)` derivation.
    pub async fn create(&self, pending_input: PendingInput) -> Result<(), Error> {
        match get_as::<PendingInput>(self.store.as_ref(), collections::PENDING_INPUTS, &pending_input.id).await {
            Ok(existing) if existing.status == PendingInputStatus::Waiting => {
                if existing.enricher_provider_id != pending_input.enricher_provider_id {
                    return Err(Error::ProviderConflict {
                        id: pending_input.id,
                        existing_provider: existing.enricher_provider_id,
                    });
                }
                Ok(())
            }
            Ok(_) | Err(store::Error::NotFound { .. }) => {
                put_as(self.store.as_ref(), collections::PENDING_INPUTS, &pending_input.id.clone(), &pending_input).await?;
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Loads a pending input by id.
    pub async fn get(&self, id: &str) -> Result<PendingInput, Error> {
        match get_as::<PendingInput>(self.store.as_ref(), collections::PENDING_INPUTS, id).await {
            Ok(pending_input) => Ok(pending_input),
            Err(store::Error::NotFound { .. }) => Err(Error::NotFound { id: id.to_string() }),
            Err(err) => Err(err.into()),
        }
    }

    /// Returns every still-WAITING suspension for `provider_id`, for a
    /// background poller to attempt to auto-populate (spec.md §4.5
    /// `auto_populate`).
    pub async fn list_waiting_for_provider(&self, provider_id: &str) -> Result<Vec<PendingInput>, Error> {
        let all: Vec<(String, PendingInput)> = store::document::scan_as(self.store.as_ref(), collections::PENDING_INPUTS).await?;
        Ok(all
            .into_iter()
            .map(|(_, doc)| doc)
            .filter(|pending_input| pending_input.status == PendingInputStatus::Waiting && pending_input.enricher_provider_id == provider_id)
            .collect())
    }

    /// Resolves `id` with `input_data`, marking it COMPLETED and publishing
    /// a [`ResumeSignal`] so the Enricher Orchestrator re-runs the
    /// suspending provider (spec.md §4.3 resume behavior). `auto_populated`
    /// should be `true` when a background poller, not a human, supplied the
    /// data.
    pub async fn complete(
        &self,
        id: &str,
        input_data: HashMap<String, String>,
        auto_populated: bool,
        now: DateTime<Utc>,
    ) -> Result<(), Error> {
        let mut pending_input = self.get(id).await?;
        pending_input.status = PendingInputStatus::Completed;
        pending_input.completed_at = Some(now);
        pending_input.input_data = input_data;
        pending_input.auto_populated = auto_populated;
        put_as(self.store.as_ref(), collections::PENDING_INPUTS, id, &pending_input).await?;

        let signal = ResumeSignal {
            pipeline_execution_id: pending_input.pipeline_execution_id.clone(),
            resume_pending_input_id: pending_input.id.clone(),
            resume_only_enrichers: vec![pending_input.enricher_provider_id.clone()],
        };
        let mut attributes = HashMap::new();
        let _ = attributes.insert("pipeline_execution_id".to_string(), signal.pipeline_execution_id.clone());
        let _ = publish(
            self.bus.as_ref(),
            topics::PIPELINE_ACTIVITY,
            "fitglue://pending-input-manager",
            "com.fitglue.pipeline-activity.resume",
            &signal,
            attributes,
        )
        .await?;
        Ok(())
    }

    /// Marks `id` as no longer blocking, without ever being resolved: the
    /// pipeline proceeds without this enrichment. Leaves the row itself
    /// WAITING (per spec.md §4.5, this is distinct from COMPLETED) but
    /// flags it so the orchestrator treats it as non-blocking on replay.
    pub async fn continue_without_resolution(&self, id: &str) -> Result<(), Error> {
        let mut pending_input = self.get(id).await?;
        pending_input.continued_without_resolution = true;
        put_as(self.store.as_ref(), collections::PENDING_INPUTS, id, &pending_input).await?;
        Ok(())
    }

    /// Cancels a suspension outright (e.g. the owning run was reposted from
    /// scratch and this suspension no longer applies).
    pub async fn cancel(&self, id: &str) -> Result<(), Error> {
        let mut pending_input = self.get(id).await?;
        pending_input.status = PendingInputStatus::Cancelled;
        put_as(self.store.as_ref(), collections::PENDING_INPUTS, id, &pending_input).await?;
        Ok(())
    }
}

/// Builds a fresh, WAITING pending input. Used by the Enricher Orchestrator
/// when a provider returns `WaitForInput` (spec.md §4.3 step 2).
#[allow(clippy::too_many_arguments)]
pub fn new_waiting(
    source: &str,
    external_id: &str,
    enricher_provider_id: &str,
    user_id: &str,
    activity_id: &str,
    pipeline_id: &str,
    pipeline_execution_id: &str,
    required_fields: Vec<String>,
    metadata: HashMap<String, String>,
    original_payload: OriginalPayload,
    now: DateTime<Utc>,
) -> PendingInput {
    PendingInput {
        id: stable_id(source, external_id, enricher_provider_id),
        user_id: user_id.to_string(),
        activity_id: activity_id.to_string(),
        pipeline_id: pipeline_id.to_string(),
        pipeline_execution_id: pipeline_execution_id.to_string(),
        linked_activity_id: None,
        enricher_provider_id: enricher_provider_id.to_string(),
        required_fields,
        status: PendingInputStatus::Waiting,
        auto_populated: false,
        continued_without_resolution: false,
        created_at: now,
        completed_at: None,
        input_data: HashMap::new(),
        metadata,
        original_payload,
    }
}
