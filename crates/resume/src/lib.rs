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

//! Resume Controller (C11): three operator/user-initiated repost
//! operations (spec.md §4.6), each producing a fresh
//! `pipeline_execution_id` and a brand-new `PipelineRun` so the router and
//! upload workers treat it exactly like any other execution. Tier-gating
//! and signature checks live outside the core; every method here accepts
//! an already-authorized `user_id` (spec.md §4.6, §7).

use std::collections::HashMap;
use std::sync::Arc;

use audit::AuditLog;
use chrono::{DateTime, Utc};
use config::{EngineConfig, PipelineConfigStore};
use ledger::{DestinationRow, Ledger, PipelineRun};
use model::{Destination, DestinationStatus, EnrichedActivityEvent, NormalizedActivity};
use splitter::PipelineActivityEvent;
use store::blob::BlobStore;
use store::bus::{self, topics, MessageBus};
use store::document::DocumentStore;
use thiserror::Error;

/// Errors raised while servicing a repost.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RepostError {
    /// No pipeline run exists for `(user_id, activity_id)`.
    #[error("no pipeline run found for activity '{activity_id}'")]
    ActivityNotFound {
        /// The activity id the caller named.
        activity_id: String,
    },
    /// A missed-destination repost named a destination that already settled
    /// SUCCESS on the original run.
    #[error("destination '{destination}' has already succeeded for activity '{activity_id}'")]
    DestinationAlreadySucceeded {
        /// The activity id the caller named.
        activity_id: String,
        /// The destination that already succeeded.
        destination: String,
    },
    /// Neither the original run's blob snapshot nor the audit log has a
    /// usable record to reconstruct from.
    #[error("no snapshot available to repost pipeline run '{run_id}'")]
    NoSnapshotAvailable {
        /// The run this repost targeted.
        run_id: String,
    },
    /// A stored snapshot failed to deserialize.
    #[error("corrupt snapshot for pipeline run '{run_id}': {message}")]
    CorruptSnapshot {
        /// The run this snapshot belonged to.
        run_id: String,
        /// The decode error.
        message: String,
    },
    /// The ledger failed.
    #[error(transparent)]
    Ledger(#[from] ledger::Error),
    /// The audit log failed.
    #[error(transparent)]
    Audit(#[from] audit::Error),
    /// The blob store, document store, or bus failed.
    #[error(transparent)]
    Store(#[from] store::Error),
    /// The pipeline config store failed.
    #[error(transparent)]
    Config(#[from] config::Error),
}

impl RepostError {
    /// Maps this error onto the repost endpoint's user-visible status code
    /// (spec.md §7): 4xx for bad input, 5xx for anything that should be
    /// retried rather than surfaced as a permanent rejection. Tier-gating
    /// (403) is the external auth collaborator's concern, not this crate's.
    pub fn status_hint(&self) -> u16 {
        match self {
            RepostError::ActivityNotFound { .. } => 404,
            RepostError::DestinationAlreadySucceeded { .. } => 409,
            RepostError::NoSnapshotAvailable { .. } => 409,
            RepostError::CorruptSnapshot { .. } => 500,
            RepostError::Ledger(_) | RepostError::Audit(_) | RepostError::Store(_) | RepostError::Config(_) => 500,
        }
    }
}

/// What a successful repost call produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepostOutcome {
    /// The freshly generated execution id the repost published under.
    pub pipeline_execution_id: String,
    /// The execution id of the run the repost was derived from.
    pub original_execution_id: String,
}

/// Services missed-destination, retry-destination, and full-pipeline
/// reposts against the pipeline-run ledger (spec.md §4.6).
pub struct ResumeController {
    ledger: Ledger,
    audit: AuditLog,
    pipeline_configs: PipelineConfigStore,
    blob: Arc<dyn BlobStore>,
    bus: Arc<dyn MessageBus>,
}

impl ResumeController {
    /// Builds a controller from process configuration and the shared
    /// adapters (spec.md §6).
    pub fn new(_config: &EngineConfig, document_store: Arc<dyn DocumentStore>, blob: Arc<dyn BlobStore>, bus: Arc<dyn MessageBus>) -> Self {
        Self {
            ledger: Ledger::new(document_store.clone()),
            audit: AuditLog::new(document_store.clone()),
            pipeline_configs: PipelineConfigStore::new(document_store),
            blob,
            bus,
        }
    }

    /// Reposts the original enriched event to a single destination that
    /// never ran (spec.md §4.6 item 1). Fails if `destination` already
    /// settled SUCCESS on the original run.
    pub async fn missed_destination(&self, user_id: &str, activity_id: &str, destination: &Destination, now: DateTime<Utc>) -> Result<RepostOutcome, RepostError> {
        let original = self.latest_run(user_id, activity_id).await?;
        if self.destination_succeeded(&original, destination).await? {
            return Err(RepostError::DestinationAlreadySucceeded {
                activity_id: activity_id.to_string(),
                destination: destination.to_string(),
            });
        }
        self.repost(&original, destination, false, None, "missed_destination", now).await
    }

    /// Reposts the original enriched event to a single destination,
    /// allowed even when it already succeeded (spec.md §4.6 item 2): if it
    /// did, carries `use_update_method=true` and the prior `external_id` so
    /// the upload worker updates in place instead of creating a duplicate.
    pub async fn retry_destination(&self, user_id: &str, activity_id: &str, destination: &Destination, now: DateTime<Utc>) -> Result<RepostOutcome, RepostError> {
        let original = self.latest_run(user_id, activity_id).await?;
        let existing = self.destination_row(&original, destination).await?;
        let (use_update_method, existing_external_id) = match existing {
            Some(row) if row.status == DestinationStatus::Success => (true, row.external_id),
            _ => (false, None),
        };
        self.repost(&original, destination, use_update_method, existing_external_id, "retry_destination", now).await
    }

    /// Reposts the original, pre-enrichment payload to `pipeline-activity`
    /// with `bypass_dedup=true` so the entire stack re-runs (spec.md §4.6
    /// item 3). Callers should warn the requester that this may produce
    /// duplicate destination uploads alongside the original run.
    pub async fn full_pipeline(&self, user_id: &str, activity_id: &str, now: DateTime<Utc>) -> Result<RepostOutcome, RepostError> {
        let original = self.latest_run(user_id, activity_id).await?;
        let activity = self.hydrate_original_payload(&original).await?;

        let new_execution_id = splitter::new_pipeline_execution_id("exec");
        let event = PipelineActivityEvent {
            activity,
            pipeline_id: original.pipeline_id.clone(),
            pipeline_execution_id: new_execution_id.clone(),
            bypass_dedup: Some(true),
        };

        let mut attributes = HashMap::new();
        let _ = attributes.insert("pipeline_execution_id".to_string(), new_execution_id.clone());
        let _ = attributes.insert("repost_type".to_string(), "full_pipeline".to_string());
        let _ = attributes.insert("original_execution_id".to_string(), original.id.clone());
        let _ = bus::publish(self.bus.as_ref(), topics::PIPELINE_ACTIVITY, "fitglue://resume", "com.fitglue.pipeline-activity", &event, attributes).await?;

        tracing::warn!(activity_id, original_execution_id = %original.id, "full-pipeline repost may duplicate destination uploads already recorded on the original run");

        Ok(RepostOutcome {
            pipeline_execution_id: new_execution_id,
            original_execution_id: original.id,
        })
    }

    async fn latest_run(&self, user_id: &str, activity_id: &str) -> Result<PipelineRun, RepostError> {
        let mut runs = self.ledger.find_by_user_activity(user_id, activity_id).await?;
        runs.sort_by_key(|run| run.started_at);
        runs.pop().ok_or_else(|| RepostError::ActivityNotFound { activity_id: activity_id.to_string() })
    }

    async fn destination_row(&self, run: &PipelineRun, destination: &Destination) -> Result<Option<DestinationRow>, RepostError> {
        let rows = self.ledger.destinations(&run.id).await?;
        Ok(rows.into_iter().find(|row| &row.destination == destination))
    }

    async fn destination_succeeded(&self, run: &PipelineRun, destination: &Destination) -> Result<bool, RepostError> {
        Ok(self
            .destination_row(run, destination)
            .await?
            .is_some_and(|row| row.status == DestinationStatus::Success))
    }

    /// Hydrates the original run's enriched event, preferring the blob
    /// snapshot and falling back to the audit log (spec.md §4.6).
    async fn hydrate_enriched_event(&self, run: &PipelineRun) -> Result<EnrichedActivityEvent, RepostError> {
        if let Some(uri) = &run.enriched_event_uri {
            let bytes = self.blob.get(uri).await?;
            return serde_json::from_slice(&bytes).map_err(|err| RepostError::CorruptSnapshot {
                run_id: run.id.clone(),
                message: err.to_string(),
            });
        }
        let json = self
            .audit
            .find_outputs_by_pipeline_execution_id(&run.id)
            .await?
            .ok_or_else(|| RepostError::NoSnapshotAvailable { run_id: run.id.clone() })?;
        serde_json::from_str(&json).map_err(|err| RepostError::CorruptSnapshot {
            run_id: run.id.clone(),
            message: err.to_string(),
        })
    }

    /// Hydrates the original, pre-enrichment payload, preferring the blob
    /// snapshot and falling back to the audit log (spec.md §4.6).
    async fn hydrate_original_payload(&self, run: &PipelineRun) -> Result<NormalizedActivity, RepostError> {
        if let Some(uri) = &run.original_payload_uri {
            let bytes = self.blob.get(uri).await?;
            return serde_json::from_slice(&bytes).map_err(|err| RepostError::CorruptSnapshot {
                run_id: run.id.clone(),
                message: err.to_string(),
            });
        }
        let json = self
            .audit
            .find_inputs_by_pipeline_execution_id(&run.id)
            .await?
            .ok_or_else(|| RepostError::NoSnapshotAvailable { run_id: run.id.clone() })?;
        serde_json::from_str(&json).map_err(|err| RepostError::CorruptSnapshot {
            run_id: run.id.clone(),
            message: err.to_string(),
        })
    }

    async fn repost(
        &self,
        original: &PipelineRun,
        destination: &Destination,
        use_update_method: bool,
        existing_external_id: Option<String>,
        repost_type: &str,
        now: DateTime<Utc>,
    ) -> Result<RepostOutcome, RepostError> {
        let mut event = self.hydrate_enriched_event(original).await?;

        event.destinations = vec![destination.clone()];
        event.enrichment_metadata = model::normalize_casing(event.enrichment_metadata);
        event.is_resume = None;
        event.resume_only_enrichers = None;
        event.resume_pending_input_id = None;
        event.enriched_event_uri = None;
        event.use_update_method = if use_update_method { Some(true) } else { None };

        let new_execution_id = splitter::new_pipeline_execution_id("exec");
        event.pipeline_execution_id = new_execution_id.clone();

        if let Ok(defaults) = self.pipeline_configs.destination_defaults(&original.user_id, &original.pipeline_id, destination).await {
            if !defaults.is_empty() {
                if let Ok(encoded) = serde_json::to_string(&defaults) {
                    let _ = event.enrichment_metadata.insert(model::metadata_keys::destination_plugin_config(&destination.to_string()), encoded);
                }
            }
        }

        let mut new_run = PipelineRun::new(
            new_execution_id.clone(),
            original.user_id.clone(),
            original.pipeline_id.clone(),
            original.activity_id.clone(),
            original.source.clone(),
            now,
        );
        new_run.applied_enrichers = original.applied_enrichers.clone();
        new_run.enrichment_metadata = event.enrichment_metadata.clone();
        new_run.description_fragments = original.description_fragments.clone();
        new_run.tags = event.activity.tags.clone();
        new_run.original_payload_uri = original.original_payload_uri.clone();
        self.ledger.create(&new_run).await?;

        let mut attributes = HashMap::new();
        let _ = attributes.insert("pipeline_execution_id".to_string(), new_execution_id.clone());
        let _ = attributes.insert("repost_type".to_string(), repost_type.to_string());
        let _ = attributes.insert("original_execution_id".to_string(), original.id.clone());
        if use_update_method {
            let _ = attributes.insert("use_update_method".to_string(), "true".to_string());
            if let Some(external_id) = &existing_external_id {
                let _ = attributes.insert("existing_external_id".to_string(), external_id.clone());
            }
        }

        let _ = bus::publish(self.bus.as_ref(), topics::ENRICHED_ACTIVITY, "fitglue://resume", "com.fitglue.enriched-activity", &event, attributes).await?;

        Ok(RepostOutcome {
            pipeline_execution_id: new_execution_id,
            original_execution_id: original.id.clone(),
        })
    }
}
