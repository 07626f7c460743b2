//! Scenario S2 (spec.md §8): an enricher suspends waiting for missing
//! input, the caller supplies it out of band, and the pipeline resumes
//! and completes.

mod common;

use std::sync::Arc;

use enricher::{EnricherInbound, EnricherOrchestrator, Outcome};
use ledger::{Ledger, RunStatus};
use model::Destination;
use pending_input::{PendingInputManager, ResumeSignal};
use router::DestinationRouter;
use store::blob::InMemoryBlobStore;
use store::bus::{self, topics, InMemoryMessageBus};
use store::document::InMemoryDocumentStore;
use upload::{handle_envelope, UploadReporter};

use common::{activity_with_hr_samples, engine_config, pipeline, now, AlwaysSucceedsWorker, TestProviderFactory};

#[tokio::test]
async fn suspends_then_resumes_and_settles_success() {
    let documents = Arc::new(InMemoryDocumentStore::new());
    let blob = Arc::new(InMemoryBlobStore::new());
    let bus = Arc::new(InMemoryMessageBus::new());

    let pipelines = vec![pipeline("p1", vec!["parkrun"], vec![Destination::Strava])];
    let activity = activity_with_hr_samples("hv-2", vec![150, 155]);
    let event = splitter::split(&activity, &pipelines, None).into_iter().next().expect("one pipeline matched");
    let run_id = event.pipeline_execution_id.clone();

    let orchestrator = EnricherOrchestrator::new(&engine_config(), Arc::new(TestProviderFactory), blob.clone(), documents.clone(), bus.clone());
    let outcome = orchestrator.handle(EnricherInbound::Fresh(event), &pipelines[0], now()).await.unwrap();

    let pending_input_id = match outcome {
        Outcome::AwaitingInput { pending_input_id } => pending_input_id,
        other => panic!("expected AwaitingInput, got {other:?}"),
    };

    let ledger = Ledger::new(documents.clone());
    assert_eq!(ledger.get(&run_id).await.unwrap().status, RunStatus::AwaitingInput);

    let mut resumes = bus.subscribe(&topics::PIPELINE_ACTIVITY).await;

    let pending_manager = PendingInputManager::new(documents.clone(), bus.clone());
    let mut input_data = std::collections::HashMap::new();
    let _ = input_data.insert("position".to_string(), "30th overall".to_string());
    pending_manager.complete(&pending_input_id, input_data, false, now()).await.unwrap();

    let envelope = resumes.recv().await.expect("resume signal published");
    let signal: ResumeSignal = bus::decode(&envelope).unwrap();
    assert_eq!(signal.pipeline_execution_id, run_id);
    let resumed_pending_input_id = signal.resume_pending_input_id.clone();
    let resumed_enrichers = signal.resume_only_enrichers.clone();

    let outcome = orchestrator.handle(EnricherInbound::Resume(signal), &pipelines[0], now()).await.unwrap();
    let enriched = match outcome {
        Outcome::Published(event) => event,
        other => panic!("expected Published after resume, got {other:?}"),
    };
    assert!(enriched.activity.description.contains("Position: 30th overall"));
    // spec.md §8 invariant 4: resuming reconstructs the suspended event with
    // these three resume markers populated and nothing else disturbed.
    assert_eq!(enriched.is_resume, Some(true));
    assert_eq!(enriched.resume_only_enrichers, Some(resumed_enrichers));
    assert_eq!(enriched.resume_pending_input_id, Some(resumed_pending_input_id));

    let mut strava_uploads = bus.subscribe(&topics::upload("strava")).await;
    let router = DestinationRouter::new(documents.clone(), bus.clone());
    let _ = router.route(&enriched, now()).await.unwrap();
    let upload_envelope = strava_uploads.recv().await.expect("upload envelope published");

    let worker = AlwaysSucceedsWorker {
        destination: Destination::Strava,
        external_id: "st-888",
    };
    let reporter = UploadReporter::new(documents.clone());
    handle_envelope(&worker, &reporter, &upload_envelope, now()).await.unwrap();

    assert_eq!(ledger.get(&run_id).await.unwrap().status, RunStatus::Success);
}
