//! Scenario S1 (spec.md §8): a fresh activity with no prior history runs
//! splitter -> enricher -> router -> upload end to end and settles SUCCESS.

mod common;

use std::sync::Arc;

use enricher::{EnricherInbound, EnricherOrchestrator, Outcome};
use ledger::{Ledger, RunStatus};
use model::Destination;
use router::DestinationRouter;
use store::blob::InMemoryBlobStore;
use store::bus::{topics, InMemoryMessageBus};
use store::document::InMemoryDocumentStore;
use store::loop_prevention::LoopPreventionStore;
use upload::{handle_envelope, UploadReporter};

use common::{activity_with_hr_samples, engine_config, pipeline, now, AlwaysSucceedsWorker, TestProviderFactory};

#[tokio::test]
async fn happy_path_settles_success_and_records_loop_prevention() {
    let documents = Arc::new(InMemoryDocumentStore::new());
    let blob = Arc::new(InMemoryBlobStore::new());
    let bus = Arc::new(InMemoryMessageBus::new());

    let pipelines = vec![pipeline("p1", vec!["heart-rate-summary"], vec![Destination::Strava])];
    let activity = activity_with_hr_samples("hv-1", vec![120, 130, 140]);

    let events = splitter::split(&activity, &pipelines, None);
    assert_eq!(events.len(), 1);
    let event = events.into_iter().next().expect("one pipeline matched");
    let run_id = event.pipeline_execution_id.clone();

    let orchestrator = EnricherOrchestrator::new(&engine_config(), Arc::new(TestProviderFactory), blob, documents.clone(), bus.clone());
    let outcome = orchestrator.handle(EnricherInbound::Fresh(event), &pipelines[0], now()).await.unwrap();

    let enriched = match outcome {
        Outcome::Published(event) => event,
        other => panic!("expected Published, got {other:?}"),
    };
    assert!(enriched.activity.description.contains("HR: 120-140 avg 130"));

    let mut strava_uploads = bus.subscribe(&topics::upload("strava")).await;

    let router = DestinationRouter::new(documents.clone(), bus.clone());
    let route_outcome = router.route(&enriched, now()).await.unwrap();
    assert_eq!(route_outcome.decisions, vec![(Destination::Strava, router::RouteDecision::Routed)]);

    let envelope = strava_uploads.recv().await.expect("upload envelope published");
    let worker = AlwaysSucceedsWorker {
        destination: Destination::Strava,
        external_id: "st-777",
    };
    let reporter = UploadReporter::new(documents.clone());
    handle_envelope(&worker, &reporter, &envelope, now()).await.unwrap();

    let ledger = Ledger::new(documents.clone());
    let run = ledger.get(&run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Success);

    let loop_prevention = LoopPreventionStore::new(documents);
    let record = loop_prevention.find_by_destination("strava", "st-777").await.unwrap();
    assert!(record.is_some());
}
