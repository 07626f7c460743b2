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

//! Pipeline-Run Ledger (C14): the authoritative per-execution state
//! machine (spec.md §4.7). `PipelineRun` is created once, at Enricher
//! entry, and never deleted; destination rows settle independently and the
//! run's terminal status is derived, not assigned.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use model::{Destination, DestinationStatus};
use serde::{Deserialize, Serialize};
use store::document::{collections, create_as, get_as, put_as, scan_as, DocumentStore};
use thiserror::Error;

/// Errors raised by the ledger.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// No run exists for the given id.
    #[error("pipeline run '{id}' not found")]
    NotFound {
        /// The run id that was looked up.
        id: String,
    },

    /// The underlying store failed.
    #[error(transparent)]
    Store(#[from] store::Error),
}

/// Lifecycle states of a `PipelineRun` (spec.md §4.7).
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    /// Enrichment or routing is in progress.
    Running,
    /// Suspended on a pending input.
    AwaitingInput,
    /// Every configured destination settled SUCCESS.
    Success,
    /// At least one destination settled SUCCESS and at least one FAILED.
    Partial,
    /// Every configured destination settled FAILED.
    Failed,
    /// A provider halted the pipeline before routing.
    Halted,
}

/// A single destination's delivery status within one run (spec.md §3, §4.4,
/// §4.7). Stored as its own document keyed by `(run_id, destination)` so
/// concurrent upload workers update disjoint rows without racing on the
/// run document itself.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DestinationRow {
    /// The run this row belongs to.
    pub run_id: String,
    /// The destination this row tracks.
    pub destination: Destination,
    /// Current delivery status.
    pub status: DestinationStatus,
    /// The destination's id for the uploaded activity, once known.
    pub external_id: Option<String>,
    /// The last error message, if the last attempt failed.
    pub error: Option<String>,
    /// Number of delivery attempts so far.
    pub attempts: u32,
    /// Timestamp of the last attempt.
    pub last_attempt_at: Option<DateTime<Utc>>,
}

fn destination_row_id(run_id: &str, destination: &Destination) -> String {
    format!("{run_id}:{destination}")
}

/// The authoritative per-execution ledger entry (spec.md §3).
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PipelineRun {
    /// Equal to `pipeline_execution_id`.
    pub id: String,
    /// The owning user.
    pub user_id: String,
    /// The pipeline configuration this run executed.
    pub pipeline_id: String,
    /// The activity this run processed.
    pub activity_id: String,
    /// The source the activity arrived from.
    pub source: String,
    /// When the run was created.
    pub started_at: DateTime<Utc>,
    /// When the run was last mutated.
    pub updated_at: DateTime<Utc>,
    /// Current lifecycle status.
    pub status: RunStatus,
    /// Enricher provider ids applied so far, in application order.
    pub applied_enrichers: Vec<String>,
    /// Accumulated flat metadata map.
    pub enrichment_metadata: HashMap<String, String>,
    /// Accumulated description fragments, one per contributing provider.
    pub description_fragments: Vec<String>,
    /// Accumulated tags, deduplicated preserving first-seen order.
    pub tags: Vec<String>,
    /// Blob URI of the original, unenriched payload.
    pub original_payload_uri: Option<String>,
    /// Blob URI the in-progress or final enriched event was offloaded to.
    pub enriched_event_uri: Option<String>,
    /// The provider id currently blocking the run, while AWAITING_INPUT.
    pub awaiting_provider: Option<String>,
    /// The reason a provider gave for halting, while HALTED.
    pub halt_reason: Option<String>,
    /// Whether this run bypassed the deduplication gate.
    pub bypass_dedup: bool,
}

impl PipelineRun {
    /// Starts a new run in the `RUNNING` state.
    pub fn new(id: String, user_id: String, pipeline_id: String, activity_id: String, source: String, now: DateTime<Utc>) -> Self {
        PipelineRun {
            id,
            user_id,
            pipeline_id,
            activity_id,
            source,
            started_at: now,
            updated_at: now,
            status: RunStatus::Running,
            applied_enrichers: Vec::new(),
            enrichment_metadata: HashMap::new(),
            description_fragments: Vec::new(),
            tags: Vec::new(),
            original_payload_uri: None,
            enriched_event_uri: None,
            awaiting_provider: None,
            halt_reason: None,
            bypass_dedup: false,
        }
    }
}

/// Wraps a [`DocumentStore`] with the ledger's read/write contract.
pub struct Ledger {
    store: Arc<dyn DocumentStore>,
}

impl Ledger {
    /// Wraps `store`.
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Creates a new run. Fails if `run.id` already exists.
    pub async fn create(&self, run: &PipelineRun) -> Result<(), Error> {
        create_as(self.store.as_ref(), collections::PIPELINE_RUNS, &run.id, run).await?;
        Ok(())
    }

    /// Loads a run by id.
    pub async fn get(&self, id: &str) -> Result<PipelineRun, Error> {
        match get_as::<PipelineRun>(self.store.as_ref(), collections::PIPELINE_RUNS, id).await {
            Ok(run) => Ok(run),
            Err(store::Error::NotFound { .. }) => Err(Error::NotFound { id: id.to_string() }),
            Err(err) => Err(err.into()),
        }
    }

    /// Replaces the whole run document. Used by the Enricher Orchestrator,
    /// which owns the run for the duration of one invocation and mutates
    /// many fields (applied enrichers, description, metadata) together.
    pub async fn put(&self, run: &PipelineRun) -> Result<(), Error> {
        put_as(self.store.as_ref(), collections::PIPELINE_RUNS, &run.id, run).await?;
        Ok(())
    }

    /// Returns every run for `(user_id, pipeline_id, activity_id)`, used by
    /// the Deduplication Gate's re-ingest suppression (spec.md §4.2) and by
    /// the Resume Controller to locate the run a repost targets.
    pub async fn find_by_activity(&self, user_id: &str, pipeline_id: &str, activity_id: &str) -> Result<Vec<PipelineRun>, Error> {
        let all: Vec<(String, PipelineRun)> = scan_as(self.store.as_ref(), collections::PIPELINE_RUNS).await?;
        Ok(all
            .into_iter()
            .map(|(_, run)| run)
            .filter(|run| run.user_id == user_id && run.pipeline_id == pipeline_id && run.activity_id == activity_id)
            .collect())
    }

    /// Returns every run for `(user_id, activity_id)` regardless of which
    /// pipeline processed it, in no particular order. Used by the Resume
    /// Controller, whose repost inputs name only an activity id (spec.md
    /// §4.6): callers pick the most recently `started_at` run as "the
    /// original" when more than one pipeline has processed the activity.
    pub async fn find_by_user_activity(&self, user_id: &str, activity_id: &str) -> Result<Vec<PipelineRun>, Error> {
        let all: Vec<(String, PipelineRun)> = scan_as(self.store.as_ref(), collections::PIPELINE_RUNS).await?;
        Ok(all.into_iter().map(|(_, run)| run).filter(|run| run.user_id == user_id && run.activity_id == activity_id).collect())
    }

    /// Inserts a PENDING destination row, or leaves an existing row
    /// untouched (idempotent re-routing of the same destination).
    pub async fn insert_pending_destination(&self, run_id: &str, destination: &Destination, now: DateTime<Utc>) -> Result<(), Error> {
        let id = destination_row_id(run_id, destination);
        let row = DestinationRow {
            run_id: run_id.to_string(),
            destination: destination.clone(),
            status: DestinationStatus::Pending,
            external_id: None,
            error: None,
            attempts: 0,
            last_attempt_at: Some(now),
        };
        match self
            .store
            .create(
                collections::PIPELINE_RUN_DESTINATIONS,
                &id,
                serde_json::to_value(&row).expect("DestinationRow always serializes"),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(store::Error::AlreadyExists { .. }) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Inserts a SKIPPED destination row (router exclusion rules, spec.md §4.4).
    pub async fn insert_skipped_destination(&self, run_id: &str, destination: &Destination, now: DateTime<Utc>) -> Result<(), Error> {
        self.upsert_destination_status(run_id, destination, DestinationStatus::Skipped, None, None, now).await
    }

    /// Settles a destination row to SUCCESS or FAILED, enforcing the
    /// sticky-SUCCESS invariant: a SUCCESS with a non-empty `external_id`
    /// is terminal for the `(run, destination)` pair and a later FAILED
    /// report is dropped rather than overwriting it (spec.md §3, §7).
    pub async fn settle_destination(
        &self,
        run_id: &str,
        destination: &Destination,
        status: DestinationStatus,
        external_id: Option<String>,
        error: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), Error> {
        let id = destination_row_id(run_id, destination);
        if let Ok(existing) = get_as::<DestinationRow>(self.store.as_ref(), collections::PIPELINE_RUN_DESTINATIONS, &id).await {
            let sticky = existing.status == DestinationStatus::Success
                && existing.external_id.as_deref().is_some_and(|id| !id.is_empty());
            if sticky && status != DestinationStatus::Success {
                tracing::warn!(run_id, %destination, "dropping late non-success report against a sticky success row");
                return Ok(());
            }
        }
        self.upsert_destination_status(run_id, destination, status, external_id, error, now).await
    }

    async fn upsert_destination_status(
        &self,
        run_id: &str,
        destination: &Destination,
        status: DestinationStatus,
        external_id: Option<String>,
        error: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), Error> {
        let id = destination_row_id(run_id, destination);
        let previous_attempts = get_as::<DestinationRow>(self.store.as_ref(), collections::PIPELINE_RUN_DESTINATIONS, &id)
            .await
            .map(|row| row.attempts)
            .unwrap_or(0);
        let row = DestinationRow {
            run_id: run_id.to_string(),
            destination: destination.clone(),
            status,
            external_id,
            error,
            attempts: previous_attempts + 1,
            last_attempt_at: Some(now),
        };
        put_as(self.store.as_ref(), collections::PIPELINE_RUN_DESTINATIONS, &id, &row).await?;
        Ok(())
    }

    /// Returns every destination row recorded for `run_id`.
    pub async fn destinations(&self, run_id: &str) -> Result<Vec<DestinationRow>, Error> {
        let all: Vec<(String, DestinationRow)> = scan_as(self.store.as_ref(), collections::PIPELINE_RUN_DESTINATIONS).await?;
        Ok(all
            .into_iter()
            .map(|(_, row)| row)
            .filter(|row| row.run_id == run_id)
            .collect())
    }

    /// Derives the terminal run status from its destination rows
    /// (spec.md §4.7): `None` while any row is still PENDING, otherwise
    /// SUCCESS if every row is SUCCESS or SKIPPED, FAILED if every row is
    /// FAILED, PARTIAL otherwise. An empty destination set settles SUCCESS
    /// (spec.md §8 boundary case: zero destinations).
    pub fn derive_terminal_status(rows: &[DestinationRow]) -> Option<RunStatus> {
        if rows.iter().any(|row| row.status == DestinationStatus::Pending) {
            return None;
        }
        if rows.is_empty() || rows.iter().all(|row| matches!(row.status, DestinationStatus::Success | DestinationStatus::Skipped)) {
            return Some(RunStatus::Success);
        }
        if rows.iter().all(|row| row.status == DestinationStatus::Failed) {
            return Some(RunStatus::Failed);
        }
        Some(RunStatus::Partial)
    }

    /// Recomputes `run_id`'s terminal status from its destination rows and
    /// persists it if it changed (spec.md §4.7). A no-op while the run is
    /// AWAITING_INPUT or HALTED, since those statuses aren't derived from
    /// destination rows, and a no-op (reporting RUNNING) if the run itself
    /// doesn't exist yet. Called after every destination row mutation
    /// (router routing/skipping, upload settlement) so the run document
    /// itself, not just the rows, reflects the outcome.
    pub async fn refresh_status(&self, run_id: &str, now: DateTime<Utc>) -> Result<RunStatus, Error> {
        let mut run = match self.get(run_id).await {
            Ok(run) => run,
            Err(Error::NotFound { .. }) => return Ok(RunStatus::Running),
            Err(err) => return Err(err),
        };
        if matches!(run.status, RunStatus::AwaitingInput | RunStatus::Halted) {
            return Ok(run.status);
        }
        let rows = self.destinations(run_id).await?;
        if let Some(status) = Self::derive_terminal_status(&rows) {
            if run.status != status {
                run.status = status;
                run.updated_at = now;
                self.put(&run).await?;
            }
        }
        Ok(run.status)
    }
}
