//! The Enricher Orchestrator itself (spec.md §4.3): bounded-parallel,
//! two-phase provider fan-out, declared-order merge, suspension on
//! `WaitForInput`, halt handling, and large-payload offload before publish.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use audit::{AuditLog, ExecutionRecord};
use chrono::{DateTime, Duration, Utc};
use config::{EngineConfig, PipelineConfig};
use futures::stream::{self, StreamExt};
use ledger::{Ledger, PipelineRun, RunStatus};
use model::EnrichedActivityEvent;
use splitter::PipelineActivityEvent;
use store::blob::{paths, BlobStore};
use store::bus::MessageBus;
use store::document::DocumentStore;
use thiserror::Error;
use tracing::warn;

use crate::merge::{merge_result, reconcile_time_markers, Accumulator};
use crate::provider::{EnrichmentProvider, EnrichmentResult, ProviderError, ProviderFactory, ResumeInput};

/// Errors raised by the orchestrator.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The ledger failed.
    #[error(transparent)]
    Ledger(#[from] ledger::Error),
    /// The underlying store or blob adapter failed. A failure here while
    /// offloading a payload is fatal to the run (spec.md §7).
    #[error(transparent)]
    Store(#[from] store::Error),
    /// The pending-input manager failed.
    #[error(transparent)]
    PendingInput(#[from] pending_input::Error),
    /// `ProviderFactory::create` failed to resolve a configured provider
    /// type.
    #[error("failed to resolve provider: {0}")]
    ProviderFactory(String),
    /// A resume signal named a run that isn't AWAITING_INPUT.
    #[error("pipeline run '{run_id}' is not awaiting input")]
    NotAwaitingInput {
        /// The run id named by the resume signal.
        run_id: String,
    },
    /// An AWAITING_INPUT run has no recorded snapshot to resume from.
    #[error("pipeline run '{run_id}' has no in-progress snapshot to resume from")]
    MissingSnapshot {
        /// The run id that should have had a snapshot.
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
    /// The resume signal named no provider, or one not configured on this
    /// pipeline.
    #[error("pipeline '{pipeline_id}' has no enricher configured for provider '{provider_id}'")]
    ProviderNotConfigured {
        /// The pipeline that was resumed.
        pipeline_id: String,
        /// The provider the resume signal named.
        provider_id: String,
    },
}

/// What one `pipeline-activity` message carries (spec.md §4.3): either a
/// fresh, never-enriched activity from the Splitter, or a resume signal
/// from the Pending-Input Manager re-entering a suspended run.
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum EnricherInbound {
    /// A fresh, unenriched activity bound to one pipeline.
    Fresh(PipelineActivityEvent),
    /// A resolved suspension, re-entering the provider that raised it.
    Resume(pending_input::ResumeSignal),
}

/// What running the orchestrator on one inbound message produced.
#[derive(Debug, Clone)]
pub enum Outcome {
    /// Every provider ran (or was intentionally skipped); the event is
    /// ready for the Destination Router.
    Published(EnrichedActivityEvent),
    /// A provider raised `WaitForInput`; the run is now AWAITING_INPUT and
    /// nothing was published.
    AwaitingInput {
        /// The pending input id created or reused for this suspension.
        pending_input_id: String,
    },
    /// A provider halted the pipeline; the run is now HALTED and nothing
    /// was published.
    Halted {
        /// The halting provider's stated reason.
        reason: String,
    },
}

/// Identifies the suspension a `drive` call is continuing from, so
/// `finalize`/`suspend` can stamp the resulting `EnrichedActivityEvent` with
/// the resume markers spec.md §8 invariant 4 requires (everything else
/// about the event is unchanged from the fresh-run path).
struct ResumeContext {
    pending_input_id: String,
    resume_only_enrichers: Vec<String>,
}

enum ExecResult {
    Completed,
    Suspended {
        provider_id: String,
        required_fields: Vec<String>,
        metadata: HashMap<String, String>,
    },
    Halted {
        reason: String,
    },
}

/// Orchestrates provider fan-out for one pipeline execution (spec.md
/// §4.3). Stateless across calls; all state lives in the ledger, the blob
/// store, and the pending-input manager.
pub struct EnricherOrchestrator {
    provider_factory: Arc<dyn ProviderFactory>,
    blob: Arc<dyn BlobStore>,
    ledger: Ledger,
    audit: AuditLog,
    pending_inputs: pending_input::PendingInputManager,
    bucket: String,
    parallelism: usize,
    provider_deadline: Duration,
    payload_offload_bytes: usize,
}

impl EnricherOrchestrator {
    /// Builds an orchestrator from process configuration and the shared
    /// adapters (spec.md §6).
    pub fn new(
        config: &EngineConfig,
        provider_factory: Arc<dyn ProviderFactory>,
        blob: Arc<dyn BlobStore>,
        document_store: Arc<dyn DocumentStore>,
        bus: Arc<dyn MessageBus>,
    ) -> Self {
        Self {
            provider_factory,
            blob,
            ledger: Ledger::new(document_store.clone()),
            audit: AuditLog::new(document_store.clone()),
            pending_inputs: pending_input::PendingInputManager::new(document_store, bus),
            bucket: config.blob_bucket_default.clone(),
            parallelism: config.enricher_parallelism,
            provider_deadline: Duration::milliseconds(config.provider_deadline_ms as i64),
            payload_offload_bytes: config.payload_offload_bytes,
        }
    }

    /// Handles one inbound message against `pipeline`, returning what
    /// happened.
    pub async fn handle(&self, inbound: EnricherInbound, pipeline: &PipelineConfig, now: DateTime<Utc>) -> Result<Outcome, Error> {
        match inbound {
            EnricherInbound::Fresh(event) => self.run_fresh(event, pipeline, now).await,
            EnricherInbound::Resume(signal) => self.resume(signal, pipeline, now).await,
        }
    }

    async fn run_fresh(&self, event: PipelineActivityEvent, pipeline: &PipelineConfig, now: DateTime<Utc>) -> Result<Outcome, Error> {
        let activity_id = format!("{}:{}", event.activity.source, event.activity.external_id);
        let mut run = PipelineRun::new(
            event.pipeline_execution_id.clone(),
            event.activity.user_id.clone(),
            pipeline.id.clone(),
            activity_id,
            event.activity.source.clone(),
            now,
        );
        run.bypass_dedup = event.bypass_dedup.unwrap_or(false);

        let original_payload_uri = paths::original_payload(&self.bucket, &run.user_id, &run.id);
        let original_payload_bytes = serde_json::to_vec(&event.activity).expect("NormalizedActivity always serializes");
        match self.blob.put(&original_payload_uri, original_payload_bytes).await {
            Ok(()) | Err(store::Error::AlreadyExists { .. }) => run.original_payload_uri = Some(original_payload_uri),
            Err(err) => return Err(err.into()),
        }

        let inputs_json = serde_json::to_string(&event).ok();
        let record = ExecutionRecord::started("enricher", now).with_pipeline_execution_id(run.id.clone());
        let record = match inputs_json {
            Some(json) => record.with_inputs(json),
            None => record,
        };
        if let Err(err) = self.audit.record_new(&record).await {
            warn!(run_id = %run.id, error = %err, "failed to record enricher audit entry");
        }

        match self.ledger.create(&run).await {
            Ok(()) => {}
            Err(ledger::Error::Store(store::Error::AlreadyExists { .. })) => {
                run = self.ledger.get(&run.id).await?;
            }
            Err(err) => return Err(err.into()),
        }

        let mut acc = Accumulator {
            activity: event.activity,
            metadata: HashMap::new(),
            description_section_headers: Vec::new(),
            description_fragments: Vec::new(),
            applied_enrichers: Vec::new(),
            fit_file_content: None,
        };

        self.drive(pipeline, &mut run, &mut acc, &HashSet::new(), None, now).await
    }

    async fn resume(&self, signal: pending_input::ResumeSignal, pipeline: &PipelineConfig, now: DateTime<Utc>) -> Result<Outcome, Error> {
        let mut run = self.ledger.get(&signal.pipeline_execution_id).await?;
        if run.status != RunStatus::AwaitingInput {
            return Err(Error::NotAwaitingInput { run_id: run.id.clone() });
        }
        let uri = run.enriched_event_uri.clone().ok_or_else(|| Error::MissingSnapshot { run_id: run.id.clone() })?;
        let bytes = self.blob.get(&uri).await?;
        let event: EnrichedActivityEvent = serde_json::from_slice(&bytes).map_err(|err| Error::CorruptSnapshot {
            run_id: run.id.clone(),
            message: err.to_string(),
        })?;

        let pending_input = self.pending_inputs.get(&signal.resume_pending_input_id).await?;
        let provider_id = signal
            .resume_only_enrichers
            .first()
            .cloned()
            .ok_or_else(|| Error::ProviderNotConfigured {
                pipeline_id: pipeline.id.clone(),
                provider_id: String::new(),
            })?;
        let binding = pipeline
            .enrichers
            .iter()
            .find(|binding| binding.provider_type == provider_id)
            .ok_or_else(|| Error::ProviderNotConfigured {
                pipeline_id: pipeline.id.clone(),
                provider_id: provider_id.clone(),
            })?;
        let provider = self.provider_factory.create(&binding.provider_type).map_err(Error::ProviderFactory)?;

        let resume_ctx = ResumeContext {
            pending_input_id: signal.resume_pending_input_id.clone(),
            resume_only_enrichers: signal.resume_only_enrichers.clone(),
        };

        let mut acc = Accumulator {
            activity: event.activity,
            metadata: event.enrichment_metadata,
            description_section_headers: event.description_section_headers,
            description_fragments: run.description_fragments.clone(),
            applied_enrichers: run.applied_enrichers.clone(),
            fit_file_content: None,
        };

        let resume_input = ResumeInput {
            input_data: &pending_input.input_data,
            auto_populated: pending_input.auto_populated,
        };
        let result = match tokio::time::timeout(
            self.provider_deadline.to_std().unwrap_or(std::time::Duration::from_secs(10)),
            provider.enrich_resume(&acc.activity, &binding.inputs, resume_input),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Failed("provider deadline exceeded".to_string())),
        };

        run.status = RunStatus::Running;
        run.awaiting_provider = None;

        match result {
            Ok(enrichment_result) => {
                let halted = merge_result(&mut acc, &provider_id, enrichment_result);
                run.applied_enrichers = acc.applied_enrichers.clone();
                if let Some(reason) = halted {
                    return self.halt(&mut run, &acc, reason, now).await;
                }
            }
            Err(ProviderError::WaitForInput { required_fields, metadata }) => {
                return self.suspend(pipeline, &mut run, &mut acc, &provider_id, required_fields, metadata, Some(&resume_ctx), now).await;
            }
            Err(ProviderError::Failed(message)) => {
                let _ = acc.metadata.insert(model::metadata_keys::provider_error(&provider_id), message);
                acc.applied_enrichers.push(provider_id.clone());
                run.applied_enrichers = acc.applied_enrichers.clone();
            }
        }

        let skip: HashSet<String> = acc.applied_enrichers.iter().cloned().collect();
        self.drive(pipeline, &mut run, &mut acc, &skip, Some(&resume_ctx), now).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn drive(
        &self,
        pipeline: &PipelineConfig,
        run: &mut PipelineRun,
        acc: &mut Accumulator,
        skip: &HashSet<String>,
        resume_ctx: Option<&ResumeContext>,
        now: DateTime<Utc>,
    ) -> Result<Outcome, Error> {
        match self.execute(pipeline, acc, skip).await? {
            ExecResult::Completed => self.finalize(pipeline, run, acc, resume_ctx, now).await,
            ExecResult::Suspended {
                provider_id,
                required_fields,
                metadata,
            } => self.suspend(pipeline, run, acc, &provider_id, required_fields, metadata, resume_ctx, now).await,
            ExecResult::Halted { reason } => self.halt(run, acc, reason, now).await,
        }
    }

    async fn execute(&self, pipeline: &PipelineConfig, acc: &mut Accumulator, skip: &HashSet<String>) -> Result<ExecResult, Error> {
        let mut immediate: Vec<(&config::EnricherBinding, Box<dyn EnrichmentProvider>)> = Vec::new();
        let mut deferred: Vec<(&config::EnricherBinding, Box<dyn EnrichmentProvider>)> = Vec::new();

        for binding in &pipeline.enrichers {
            let provider = self.provider_factory.create(&binding.provider_type).map_err(Error::ProviderFactory)?;
            if skip.contains(provider.id()) {
                continue;
            }
            if provider.should_defer() {
                deferred.push((binding, provider));
            } else {
                immediate.push((binding, provider));
            }
        }

        for (deferred_phase, phase) in [(false, immediate), (true, deferred)] {
            let snapshot = acc.activity.clone();
            let results = self.run_phase(phase, &snapshot, deferred_phase).await;
            for (provider_id, outcome) in results {
                match outcome {
                    Ok(result) => {
                        if let Some(reason) = merge_result(acc, &provider_id, result) {
                            return Ok(ExecResult::Halted { reason });
                        }
                    }
                    Err(ProviderError::WaitForInput { required_fields, metadata }) => {
                        return Ok(ExecResult::Suspended {
                            provider_id,
                            required_fields,
                            metadata,
                        });
                    }
                    Err(ProviderError::Failed(message)) => {
                        let _ = acc.metadata.insert(model::metadata_keys::provider_error(&provider_id), message);
                    }
                }
            }
        }

        Ok(ExecResult::Completed)
    }

    async fn run_phase(
        &self,
        phase: Vec<(&config::EnricherBinding, Box<dyn EnrichmentProvider>)>,
        snapshot: &model::NormalizedActivity,
        deferred: bool,
    ) -> Vec<(String, Result<EnrichmentResult, ProviderError>)> {
        let deadline = self.provider_deadline.to_std().unwrap_or(std::time::Duration::from_secs(10));
        let parallelism = self.parallelism.max(1);

        let indexed: Vec<(usize, (&config::EnricherBinding, Box<dyn EnrichmentProvider>))> = phase.into_iter().enumerate().collect();
        let len = indexed.len();
        let mut results: Vec<Option<(String, Result<EnrichmentResult, ProviderError>)>> = (0..len).map(|_| None).collect();

        let mut futs = stream::iter(indexed.into_iter().map(|(index, (binding, provider))| {
            let mut inputs = binding.inputs.clone();
            if deferred {
                let _ = inputs.insert("enriched_description".to_string(), snapshot.description.clone());
            }
            async move {
                let id = provider.id().to_string();
                let outcome = match tokio::time::timeout(deadline, provider.enrich(snapshot, &inputs, false)).await {
                    Ok(result) => result,
                    Err(_) => Err(ProviderError::Failed("provider deadline exceeded".to_string())),
                };
                (index, id, outcome)
            }
        }))
        .buffer_unordered(parallelism);

        while let Some((index, id, outcome)) = futs.next().await {
            results[index] = Some((id, outcome));
        }

        results.into_iter().map(|entry| entry.expect("every phase index is filled exactly once")).collect()
    }

    async fn finalize(&self, pipeline: &PipelineConfig, run: &mut PipelineRun, acc: &mut Accumulator, resume_ctx: Option<&ResumeContext>, now: DateTime<Utc>) -> Result<Outcome, Error> {
        reconcile_time_markers(&mut acc.activity);
        acc.metadata = model::normalize_casing(std::mem::take(&mut acc.metadata));

        let mut fit_file_uri = None;
        if let Some(bytes) = acc.fit_file_content.take() {
            let uri = paths::fit_file(&self.bucket, &run.id);
            self.blob.put(&uri, bytes).await?;
            fit_file_uri = Some(uri);
        }

        let mut event = EnrichedActivityEvent {
            activity: acc.activity.clone(),
            pipeline_id: pipeline.id.clone(),
            pipeline_execution_id: run.id.clone(),
            destinations: pipeline.destinations.clone(),
            enrichment_metadata: acc.metadata.clone(),
            description_section_headers: acc.description_section_headers.clone(),
            fit_file_uri,
            original_payload_uri: run.original_payload_uri.clone(),
            enriched_event_uri: None,
            bypass_dedup: Some(run.bypass_dedup),
            is_resume: resume_ctx.map(|_| true),
            resume_only_enrichers: resume_ctx.map(|ctx| ctx.resume_only_enrichers.clone()),
            use_update_method: None,
            resume_pending_input_id: resume_ctx.map(|ctx| ctx.pending_input_id.clone()),
        };

        let serialized = serde_json::to_vec(&event).expect("EnrichedActivityEvent always serializes");
        if serialized.len() > self.payload_offload_bytes {
            let uri = format!(
                "{}-{}",
                paths::enriched_event(&self.bucket, &run.user_id, &run.id),
                uuid::Uuid::new_v4()
            );
            self.blob.put(&uri, serialized).await?;
            event.enriched_event_uri = Some(uri.clone());
            event.activity.sessions = Vec::new();
            run.enriched_event_uri = Some(uri);
        }

        run.applied_enrichers = acc.applied_enrichers.clone();
        run.enrichment_metadata = acc.metadata.clone();
        run.description_fragments = acc.description_fragments.clone();
        run.tags = acc.activity.tags.clone();
        run.updated_at = now;
        self.ledger.put(run).await?;

        let outputs_json = serde_json::to_string(&event).ok();
        let record = ExecutionRecord::started("enricher", now).with_pipeline_execution_id(run.id.clone()).succeed(outputs_json, now);
        if let Err(err) = self.audit.record_new(&record).await {
            warn!(run_id = %run.id, error = %err, "failed to record enricher audit entry");
        }

        Ok(Outcome::Published(event))
    }

    #[allow(clippy::too_many_arguments)]
    async fn suspend(
        &self,
        pipeline: &PipelineConfig,
        run: &mut PipelineRun,
        acc: &mut Accumulator,
        provider_id: &str,
        required_fields: Vec<String>,
        metadata: HashMap<String, String>,
        resume_ctx: Option<&ResumeContext>,
        now: DateTime<Utc>,
    ) -> Result<Outcome, Error> {
        let snapshot = EnrichedActivityEvent {
            activity: acc.activity.clone(),
            pipeline_id: pipeline.id.clone(),
            pipeline_execution_id: run.id.clone(),
            destinations: pipeline.destinations.clone(),
            enrichment_metadata: acc.metadata.clone(),
            description_section_headers: acc.description_section_headers.clone(),
            fit_file_uri: None,
            original_payload_uri: run.original_payload_uri.clone(),
            enriched_event_uri: None,
            bypass_dedup: Some(run.bypass_dedup),
            is_resume: resume_ctx.map(|_| true),
            resume_only_enrichers: resume_ctx.map(|ctx| ctx.resume_only_enrichers.clone()),
            use_update_method: None,
            resume_pending_input_id: resume_ctx.map(|ctx| ctx.pending_input_id.clone()),
        };
        let bytes = serde_json::to_vec(&snapshot).expect("EnrichedActivityEvent always serializes");
        let uri = format!(
            "{}-{}",
            paths::enriched_event(&self.bucket, &run.user_id, &run.id),
            uuid::Uuid::new_v4()
        );
        self.blob.put(&uri, bytes).await?;

        let pending = pending_input::new_waiting(
            &run.source,
            &activity_external_id(&run.activity_id),
            provider_id,
            &run.user_id,
            &run.activity_id,
            &pipeline.id,
            &run.id,
            required_fields,
            metadata,
            pending_input::OriginalPayload::BlobUri(uri.clone()),
            now,
        );
        let pending_input_id = pending.id.clone();
        self.pending_inputs.create(pending).await?;

        run.status = RunStatus::AwaitingInput;
        run.awaiting_provider = Some(provider_id.to_string());
        run.enriched_event_uri = Some(uri);
        run.applied_enrichers = acc.applied_enrichers.clone();
        run.enrichment_metadata = acc.metadata.clone();
        run.description_fragments = acc.description_fragments.clone();
        run.tags = acc.activity.tags.clone();
        run.updated_at = now;
        self.ledger.put(run).await?;

        Ok(Outcome::AwaitingInput { pending_input_id })
    }

    async fn halt(&self, run: &mut PipelineRun, acc: &Accumulator, reason: String, now: DateTime<Utc>) -> Result<Outcome, Error> {
        run.status = RunStatus::Halted;
        run.halt_reason = Some(reason.clone());
        run.applied_enrichers = acc.applied_enrichers.clone();
        run.enrichment_metadata = acc.metadata.clone();
        run.description_fragments = acc.description_fragments.clone();
        run.tags = acc.activity.tags.clone();
        run.updated_at = now;
        self.ledger.put(run).await?;
        Ok(Outcome::Halted { reason })
    }
}

/// `run.activity_id` is `"<source>:<external_id>"` (see `run_fresh`); this
/// recovers the external id half for deriving a pending input's stable id.
fn activity_external_id(activity_id: &str) -> String {
    activity_id.split_once(':').map(|(_, external_id)| external_id.to_string()).unwrap_or_else(|| activity_id.to_string())
}
