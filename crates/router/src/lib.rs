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

//! Destination Router (C12): the last stateless stage before the opaque
//! upload workers (spec.md §4.4). Reads one `EnrichedActivityEvent` and
//! emits one `upload-<destination>` event per destination named on it,
//! skipping (and recording SKIPPED) destinations the loop-prevention rules
//! exclude.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use ledger::Ledger;
use model::{metadata_keys, Destination, EnrichedActivityEvent};
use store::bus::{self, topics, MessageBus};
use store::document::DocumentStore;
use thiserror::Error;

/// Errors raised while routing an enriched event.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The ledger could not be read or written.
    #[error(transparent)]
    Ledger(#[from] ledger::Error),
    /// The message bus rejected a publish.
    #[error(transparent)]
    Store(#[from] store::Error),
}

/// What the router did with one destination on an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    /// An `upload-<destination>` event was published and a PENDING row
    /// inserted.
    Routed,
    /// The destination was excluded; a SKIPPED row was inserted instead.
    Skipped,
}

/// The router's decision for every destination named on the event, in the
/// order the event listed them.
#[derive(Debug, Clone, Default)]
pub struct RouteOutcome {
    /// One entry per destination on the incoming event.
    pub decisions: Vec<(Destination, RouteDecision)>,
}

impl RouteOutcome {
    /// Destinations that were actually published.
    pub fn routed(&self) -> impl Iterator<Item = &Destination> {
        self.decisions
            .iter()
            .filter(|(_, decision)| *decision == RouteDecision::Routed)
            .map(|(destination, _)| destination)
    }
}

/// Reads an `EnrichedActivityEvent` and fans it out to one `upload-<dest>`
/// topic per destination, honoring the router's two exclusion rules
/// (spec.md §4.4).
pub struct DestinationRouter {
    ledger: Ledger,
    bus: std::sync::Arc<dyn MessageBus>,
}

impl DestinationRouter {
    /// Wraps the document store (for the ledger) and message bus.
    pub fn new(document_store: std::sync::Arc<dyn DocumentStore>, bus: std::sync::Arc<dyn MessageBus>) -> Self {
        Self {
            ledger: Ledger::new(document_store),
            bus,
        }
    }

    /// Routes `event`, returning the per-destination decisions.
    pub async fn route(&self, event: &EnrichedActivityEvent, now: DateTime<Utc>) -> Result<RouteOutcome, Error> {
        let run_id = &event.pipeline_execution_id;
        let activity_id = format!("{}:{}", event.activity.source, event.activity.external_id);
        let mut outcome = RouteOutcome::default();

        for destination in &event.destinations {
            let excluded = self.already_delivered(event, &activity_id, destination).await?
                || self.is_loopback(event, destination);

            if excluded {
                self.ledger.insert_skipped_destination(run_id, destination, now).await?;
                outcome.decisions.push((destination.clone(), RouteDecision::Skipped));
                tracing::info!(%run_id, %destination, "destination excluded by router");
                continue;
            }

            let topic = topics::upload(&destination.to_string());
            let mut attributes = HashMap::new();
            let _ = attributes.insert("pipeline_execution_id".to_string(), run_id.clone());
            let _ = attributes.insert("destination".to_string(), destination.to_string());
            let _ = bus::publish(self.bus.as_ref(), &topic, "fitglue://router", "com.fitglue.upload", event, attributes).await?;

            self.ledger.insert_pending_destination(run_id, destination, now).await?;
            outcome.decisions.push((destination.clone(), RouteDecision::Routed));
            tracing::info!(%run_id, %destination, "routed to upload worker");
        }

        let _ = self.ledger.refresh_status(run_id, now).await?;
        Ok(outcome)
    }

    /// A prior run for the same `(user, source, external_id)` already
    /// delivered SUCCESS with a non-empty external id for this destination,
    /// and this event is not itself an update of that delivery.
    async fn already_delivered(&self, event: &EnrichedActivityEvent, activity_id: &str, destination: &Destination) -> Result<bool, Error> {
        if event.use_update_method == Some(true) {
            return Ok(false);
        }
        let prior_runs = self.ledger.find_by_user_activity(&event.activity.user_id, activity_id).await?;
        for run in &prior_runs {
            let rows = self.ledger.destinations(&run.id).await?;
            let delivered = rows.iter().any(|row| {
                row.destination == *destination
                    && row.status == model::DestinationStatus::Success
                    && row.external_id.as_deref().is_some_and(|id| !id.is_empty())
            });
            if delivered {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// The destination equals the activity's own source and this event
    /// isn't flagged as a same-source update.
    fn is_loopback(&self, event: &EnrichedActivityEvent, destination: &Destination) -> bool {
        if destination.to_string() != event.activity.source {
            return false;
        }
        let flag_key = metadata_keys::same_source_destination(&destination.to_string());
        event.enrichment_metadata.get(&flag_key).map(String::as_str) != Some("true")
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use chrono::TimeZone;
    use ledger::Ledger;
    use model::{metadata_keys, DestinationStatus, NormalizedActivity};
    use store::bus::InMemoryMessageBus;
    use store::document::InMemoryDocumentStore;

    use super::*;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
    }

    fn event(run_id: &str, destinations: Vec<Destination>) -> EnrichedActivityEvent {
        EnrichedActivityEvent {
            activity: NormalizedActivity {
                source: "hevy".into(),
                external_id: "hv-1".into(),
                user_id: "u1".into(),
                ..Default::default()
            },
            pipeline_id: "p1".into(),
            pipeline_execution_id: run_id.into(),
            destinations,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn routes_each_destination_and_inserts_pending_rows() {
        let documents = Arc::new(InMemoryDocumentStore::new());
        let bus = Arc::new(InMemoryMessageBus::new());
        let router = DestinationRouter::new(documents.clone(), bus.clone());
        let mut strava_uploads = bus.subscribe(&topics::upload("strava")).await;

        let outcome = router.route(&event("run-1", vec![Destination::Strava]), now()).await.unwrap();

        assert_eq!(outcome.decisions, vec![(Destination::Strava, RouteDecision::Routed)]);
        let envelope = strava_uploads.recv().await.expect("upload event published");
        assert_eq!(envelope.attributes.get("destination").unwrap(), "strava");

        let ledger = Ledger::new(documents);
        let rows = ledger.destinations("run-1").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, DestinationStatus::Pending);
    }

    #[tokio::test]
    async fn skips_destination_already_delivered_by_a_prior_run() {
        let documents = Arc::new(InMemoryDocumentStore::new());
        let bus = Arc::new(InMemoryMessageBus::new());
        let ledger = Ledger::new(documents.clone());
        ledger
            .settle_destination("run-0", &Destination::Strava, DestinationStatus::Success, Some("st-777".into()), None, now())
            .await
            .unwrap();

        let router = DestinationRouter::new(documents.clone(), bus);
        let outcome = router.route(&event("run-1", vec![Destination::Strava]), now()).await.unwrap();

        assert_eq!(outcome.decisions, vec![(Destination::Strava, RouteDecision::Skipped)]);
        let rows = ledger.destinations("run-1").await.unwrap();
        assert_eq!(rows[0].status, DestinationStatus::Skipped);
    }

    #[tokio::test]
    async fn update_method_bypasses_the_already_delivered_exclusion() {
        let documents = Arc::new(InMemoryDocumentStore::new());
        let bus = Arc::new(InMemoryMessageBus::new());
        let ledger = Ledger::new(documents.clone());
        ledger
            .settle_destination("run-0", &Destination::Strava, DestinationStatus::Success, Some("st-777".into()), None, now())
            .await
            .unwrap();

        let router = DestinationRouter::new(documents, bus);
        let mut update_event = event("run-1", vec![Destination::Strava]);
        update_event.use_update_method = Some(true);

        let outcome = router.route(&update_event, now()).await.unwrap();

        assert_eq!(outcome.decisions, vec![(Destination::Strava, RouteDecision::Routed)]);
    }

    #[tokio::test]
    async fn skips_destination_equal_to_source_without_the_update_flag() {
        let documents = Arc::new(InMemoryDocumentStore::new());
        let bus = Arc::new(InMemoryMessageBus::new());
        let router = DestinationRouter::new(documents, bus);

        let outcome = router.route(&event("run-1", vec![Destination::Other("hevy".into())]), now()).await.unwrap();

        assert_eq!(outcome.decisions, vec![(Destination::Other("hevy".into()), RouteDecision::Skipped)]);
    }

    #[tokio::test]
    async fn routing_settles_the_run_success_when_every_destination_is_skipped() {
        let documents = Arc::new(InMemoryDocumentStore::new());
        let bus = Arc::new(InMemoryMessageBus::new());
        let ledger = Ledger::new(documents.clone());
        ledger
            .create(&ledger::PipelineRun::new(
                "run-1".into(),
                "u1".into(),
                "p1".into(),
                "hevy:hv-1".into(),
                "hevy".into(),
                now(),
            ))
            .await
            .unwrap();

        let router = DestinationRouter::new(documents, bus);
        let _ = router.route(&event("run-1", vec![Destination::Other("hevy".into())]), now()).await.unwrap();

        assert_eq!(ledger.get("run-1").await.unwrap().status, ledger::RunStatus::Success);
    }

    #[tokio::test]
    async fn same_source_destination_flag_allows_the_loopback() {
        let documents = Arc::new(InMemoryDocumentStore::new());
        let bus = Arc::new(InMemoryMessageBus::new());
        let router = DestinationRouter::new(documents, bus);

        let mut flagged = event("run-1", vec![Destination::Other("hevy".into())]);
        let _ = flagged.enrichment_metadata.insert(metadata_keys::same_source_destination("hevy"), "true".into());

        let outcome = router.route(&flagged, now()).await.unwrap();

        assert_eq!(outcome.decisions, vec![(Destination::Other("hevy".into()), RouteDecision::Routed)]);
    }
}
