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

//! Execution Audit Log (C15): a per-worker step record for observability,
//! independent of the `PipelineRun` ledger (spec.md §3). Never consulted
//! for correctness — it exists so an operator can reconstruct what a
//! worker did, including the original payload a repost needs when the
//! blob it was offloaded to is unavailable (spec.md §4.6).

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use store::document::{collections, create_as, put_as, scan_as, DocumentStore};
use thiserror::Error;

/// Errors raised by the audit log.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The underlying store failed.
    #[error(transparent)]
    Store(#[from] store::Error),
}

/// Lifecycle status of one worker invocation (spec.md §3).
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    /// The worker began processing.
    Started,
    /// The worker completed without error.
    Success,
    /// The worker failed.
    Failed,
}

/// One record of a worker processing one message (spec.md §3).
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ExecutionRecord {
    /// A generated id for this record.
    pub id: String,
    /// The name of the worker/service that produced this record.
    pub service: String,
    /// Lifecycle status.
    pub status: ExecutionStatus,
    /// When the worker began processing.
    pub start_time: DateTime<Utc>,
    /// When the worker finished, if it has.
    pub end_time: Option<DateTime<Utc>>,
    /// JSON-encoded snapshot of the worker's input, for reposts that need
    /// to recover an original payload.
    pub inputs_json: Option<String>,
    /// JSON-encoded snapshot of the worker's output.
    pub outputs_json: Option<String>,
    /// The error message, if `status == FAILED`.
    pub error: Option<String>,
    /// The pipeline execution this record belongs to, if any.
    pub pipeline_execution_id: Option<String>,
}

impl ExecutionRecord {
    /// Starts a new record in the STARTED state.
    pub fn started(service: impl Into<String>, now: DateTime<Utc>) -> Self {
        ExecutionRecord {
            id: uuid::Uuid::new_v4().to_string(),
            service: service.into(),
            status: ExecutionStatus::Started,
            start_time: now,
            end_time: None,
            inputs_json: None,
            outputs_json: None,
            error: None,
            pipeline_execution_id: None,
        }
    }

    /// Attaches the pipeline execution id, returning `self` for chaining.
    pub fn with_pipeline_execution_id(mut self, id: impl Into<String>) -> Self {
        self.pipeline_execution_id = Some(id.into());
        self
    }

    /// Attaches a JSON snapshot of the worker's input, returning `self`
    /// for chaining.
    pub fn with_inputs(mut self, inputs_json: impl Into<String>) -> Self {
        self.inputs_json = Some(inputs_json.into());
        self
    }

    /// Marks the record SUCCESS.
    pub fn succeed(mut self, outputs_json: Option<String>, now: DateTime<Utc>) -> Self {
        self.status = ExecutionStatus::Success;
        self.end_time = Some(now);
        self.outputs_json = outputs_json;
        self
    }

    /// Marks the record FAILED.
    pub fn fail(mut self, error: impl Into<String>, now: DateTime<Utc>) -> Self {
        self.status = ExecutionStatus::Failed;
        self.end_time = Some(now);
        self.error = Some(error.into());
        self
    }
}

/// Appends [`ExecutionRecord`]s to the audit log and supports the narrow
/// read path reposts use to recover a lost original payload.
pub struct AuditLog {
    store: Arc<dyn DocumentStore>,
}

impl AuditLog {
    /// Wraps `store`.
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Records `record`, overwriting any prior record with the same id
    /// (a worker typically writes a STARTED record, then a SUCCESS/FAILED
    /// record reusing the same id once it completes).
    pub async fn record(&self, record: &ExecutionRecord) -> Result<(), Error> {
        put_as(self.store.as_ref(), collections::EXECUTIONS, &record.id, record).await?;
        Ok(())
    }

    /// Records a brand-new record, failing if the id is already taken.
    pub async fn record_new(&self, record: &ExecutionRecord) -> Result<(), Error> {
        create_as(self.store.as_ref(), collections::EXECUTIONS, &record.id, record).await?;
        Ok(())
    }

    /// Finds the most recent SUCCESS record carrying `pipeline_execution_id`
    /// and a non-empty `inputs_json`, the audit-log fallback path a full-
    /// pipeline repost uses when `original_payload_uri` is unavailable
    /// (spec.md §4.6).
    pub async fn find_inputs_by_pipeline_execution_id(&self, pipeline_execution_id: &str) -> Result<Option<String>, Error> {
        let all: Vec<(String, ExecutionRecord)> = scan_as(self.store.as_ref(), collections::EXECUTIONS).await?;
        Ok(all
            .into_iter()
            .map(|(_, record)| record)
            .filter(|record| record.pipeline_execution_id.as_deref() == Some(pipeline_execution_id))
            .filter(|record| record.inputs_json.is_some())
            .max_by_key(|record| record.start_time)
            .and_then(|record| record.inputs_json))
    }

    /// Finds the most recent record carrying `pipeline_execution_id` and a
    /// non-empty `outputs_json`, the audit-log fallback path a missed- or
    /// retry-destination repost uses to reconstruct the original
    /// `EnrichedActivityEvent` when `enriched_event_uri` is unavailable
    /// (spec.md §4.6).
    pub async fn find_outputs_by_pipeline_execution_id(&self, pipeline_execution_id: &str) -> Result<Option<String>, Error> {
        let all: Vec<(String, ExecutionRecord)> = scan_as(self.store.as_ref(), collections::EXECUTIONS).await?;
        Ok(all
            .into_iter()
            .map(|(_, record)| record)
            .filter(|record| record.pipeline_execution_id.as_deref() == Some(pipeline_execution_id))
            .filter(|record| record.outputs_json.is_some())
            .max_by_key(|record| record.start_time)
            .and_then(|record| record.outputs_json))
    }
}
