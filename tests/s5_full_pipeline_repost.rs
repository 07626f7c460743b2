//! Scenario S5 (spec.md §8): a full-pipeline repost re-runs the original,
//! pre-enrichment payload from scratch, bypassing dedup, and produces a
//! second pipeline run alongside the original rather than replacing it.

mod common;

use std::sync::Arc;

use audit::{AuditLog, ExecutionRecord};
use dedup::{Decision, DedupGate, DedupRequest};
use enricher::{EnricherInbound, EnricherOrchestrator};
use ledger::{Ledger, PipelineRun};
use model::{Destination, NormalizedActivity};
use resume::ResumeController;
use splitter::PipelineActivityEvent;
use store::blob::InMemoryBlobStore;
use store::bus::{self, topics, InMemoryMessageBus};
use store::document::{DocumentStore, InMemoryDocumentStore};
use store::loop_prevention::LoopPreventionStore;

use common::{engine_config, pipeline, now, TestProviderFactory};

#[tokio::test]
async fn full_pipeline_repost_bypasses_dedup_and_creates_a_second_run() {
    let documents: Arc<dyn DocumentStore> = Arc::new(InMemoryDocumentStore::new());
    let ledger = Ledger::new(documents.clone());
    let audit = AuditLog::new(documents.clone());

    let original_run = PipelineRun::new("run-1".to_string(), "u1".to_string(), "p1".to_string(), "hevy:hv-5".to_string(), "hevy".to_string(), now());
    ledger.create(&original_run).await.unwrap();
    ledger
        .settle_destination(&original_run.id, &Destination::Strava, model::DestinationStatus::Success, Some("st-777".to_string()), None, now())
        .await
        .unwrap();

    let original_activity = NormalizedActivity {
        source: "hevy".to_string(),
        external_id: "hv-5".to_string(),
        user_id: "u1".to_string(),
        ..Default::default()
    };
    let record = ExecutionRecord::started("splitter", now())
        .with_pipeline_execution_id(original_run.id.clone())
        .with_inputs(serde_json::to_string(&original_activity).unwrap());
    audit.record_new(&record).await.unwrap();

    let blob = Arc::new(InMemoryBlobStore::new());
    let bus = Arc::new(InMemoryMessageBus::new());
    let controller = ResumeController::new(&engine_config(), documents.clone(), blob.clone(), bus.clone());

    let mut pipeline_activity = bus.subscribe(topics::PIPELINE_ACTIVITY).await;
    let outcome = controller.full_pipeline("u1", "hevy:hv-5", now()).await.unwrap();
    assert_eq!(outcome.original_execution_id, original_run.id);
    assert_ne!(outcome.pipeline_execution_id, original_run.id);

    let envelope = pipeline_activity.recv().await.expect("pipeline-activity published");
    let republished: PipelineActivityEvent = bus::decode(&envelope).unwrap();
    assert_eq!(republished.bypass_dedup, Some(true));
    assert_eq!(republished.pipeline_execution_id, outcome.pipeline_execution_id);

    // Dedup allows it through even though the original run already
    // succeeded, because bypass_dedup is set.
    let loop_prevention = LoopPreventionStore::new(documents.clone());
    let gate = DedupGate::new(loop_prevention, Ledger::new(documents.clone()), engine_config().dedup_window_secs);
    let request = DedupRequest {
        user_id: "u1",
        pipeline_id: "p1",
        activity_id: "hevy:hv-5",
        source: "hevy",
        external_id: "hv-5",
        bypass_dedup: republished.bypass_dedup.unwrap_or(false),
    };
    assert_eq!(gate.evaluate(&request, now()).await.unwrap(), Decision::Allow);

    // Driving the republished event through the orchestrator creates a
    // second PipelineRun in the ledger, alongside the original.
    let pipelines = vec![pipeline("p1", vec!["heart-rate-summary"], vec![Destination::Strava])];
    let orchestrator = EnricherOrchestrator::new(&engine_config(), Arc::new(TestProviderFactory), blob, documents.clone(), bus.clone());
    let _ = orchestrator.handle(EnricherInbound::Fresh(republished), &pipelines[0], now()).await.unwrap();

    let runs = ledger.find_by_user_activity("u1", "hevy:hv-5").await.unwrap();
    assert_eq!(runs.len(), 2);
}
