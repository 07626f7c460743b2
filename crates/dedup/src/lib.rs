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

//! Deduplication Gate (C8): drops activities whose `(source, external_id)`
//! matches a previously-uploaded record (bounceback) or for which a
//! successful or suspended run already exists (re-ingest), unless
//! `bypass_dedup=true` (spec.md §4.2).

use chrono::{DateTime, Duration, Utc};
use ledger::{Ledger, RunStatus};
use store::loop_prevention::LoopPreventionStore;
use thiserror::Error;

/// Errors raised while evaluating a dedup decision.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The underlying ledger failed.
    #[error(transparent)]
    Ledger(#[from] ledger::Error),
    /// The underlying store failed.
    #[error(transparent)]
    Store(#[from] store::Error),
}

/// Why an activity was suppressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuppressedReason {
    /// An `UploadedActivityRecord` for this `(source, external_id)` exists
    /// within the recency window: this is the engine's own upload arriving
    /// back through the source's webhook.
    Bounceback,
    /// A `PipelineRun` for this `(user, pipeline, activity)` is already
    /// SUCCESS or AWAITING_INPUT.
    ReIngest,
}

/// The gate's verdict for one candidate activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The activity should proceed to the next stage.
    Allow,
    /// The activity should be dropped silently.
    Suppress(SuppressedReason),
}

/// The request the gate evaluates: identifies the activity and the
/// pipeline it would run under.
pub struct DedupRequest<'a> {
    /// The owning user.
    pub user_id: &'a str,
    /// The pipeline this activity would run under.
    pub pipeline_id: &'a str,
    /// The activity's stable id, usually `"<source>:<external_id>"`.
    pub activity_id: &'a str,
    /// The source the activity arrived from.
    pub source: &'a str,
    /// The source's id for the activity.
    pub external_id: &'a str,
    /// When set, both suppressions are skipped (spec.md §4.2).
    pub bypass_dedup: bool,
}

/// Evaluates both suppressions against the ledger and loop-prevention
/// store.
pub struct DedupGate {
    loop_prevention: LoopPreventionStore,
    ledger: Ledger,
    window: Duration,
}

impl DedupGate {
    /// Builds a gate with a bounceback recency window of `window_secs`
    /// seconds (spec.md §6 `dedup_window_secs`).
    pub fn new(loop_prevention: LoopPreventionStore, ledger: Ledger, window_secs: i64) -> Self {
        Self {
            loop_prevention,
            ledger,
            window: Duration::seconds(window_secs),
        }
    }

    /// Evaluates `request` against both suppressions.
    pub async fn evaluate(&self, request: &DedupRequest<'_>, now: DateTime<Utc>) -> Result<Decision, Error> {
        if request.bypass_dedup {
            return Ok(Decision::Allow);
        }

        if self
            .loop_prevention
            .find_bounceback(request.user_id, request.source, request.external_id, self.window, now)
            .await?
            .is_some()
        {
            return Ok(Decision::Suppress(SuppressedReason::Bounceback));
        }

        let existing_runs = self
            .ledger
            .find_by_activity(request.user_id, request.pipeline_id, request.activity_id)
            .await?;
        if existing_runs
            .iter()
            .any(|run| matches!(run.status, RunStatus::Success | RunStatus::AwaitingInput))
        {
            return Ok(Decision::Suppress(SuppressedReason::ReIngest));
        }

        Ok(Decision::Allow)
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use chrono::TimeZone;
    use ledger::PipelineRun;
    use model::Destination;
    use store::document::InMemoryDocumentStore;
    use store::loop_prevention::UploadedActivityRecord;

    use super::*;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
    }

    fn gate() -> (DedupGate, Arc<InMemoryDocumentStore>) {
        let store = Arc::new(InMemoryDocumentStore::new());
        let gate = DedupGate::new(
            LoopPreventionStore::new(store.clone()),
            Ledger::new(store.clone()),
            900,
        );
        (gate, store)
    }

    #[tokio::test]
    async fn allows_when_no_prior_activity() {
        let (gate, _store) = gate();
        let decision = gate
            .evaluate(
                &DedupRequest {
                    user_id: "u1",
                    pipeline_id: "p1",
                    activity_id: "hevy:hv-1",
                    source: "hevy",
                    external_id: "hv-1",
                    bypass_dedup: false,
                },
                now(),
            )
            .await
            .unwrap();
        assert_eq!(decision, Decision::Allow);
    }

    #[tokio::test]
    async fn suppresses_bounceback_within_window() {
        let (gate, store) = gate();
        let loop_prevention = LoopPreventionStore::new(store);
        loop_prevention
            .record_upload(UploadedActivityRecord {
                id: String::new(),
                user_id: "u1".into(),
                source: "hevy".into(),
                external_id: "hv-1".into(),
                destination: Destination::Strava.to_string(),
                destination_id: "st-777".into(),
                uploaded_at: now(),
            })
            .await
            .unwrap();

        let decision = gate
            .evaluate(
                &DedupRequest {
                    user_id: "u1",
                    pipeline_id: "p1",
                    activity_id: "hevy:hv-1",
                    source: "hevy",
                    external_id: "hv-1",
                    bypass_dedup: false,
                },
                now(),
            )
            .await
            .unwrap();
        assert_eq!(decision, Decision::Suppress(SuppressedReason::Bounceback));
    }

    #[tokio::test]
    async fn suppresses_reingest_of_a_successful_run() {
        let (gate, store) = gate();
        let ledger = Ledger::new(store);
        let mut run = PipelineRun::new("exec-1".into(), "u1".into(), "p1".into(), "hevy:hv-1".into(), "hevy".into(), now());
        run.status = RunStatus::Success;
        ledger.create(&run).await.unwrap();

        let decision = gate
            .evaluate(
                &DedupRequest {
                    user_id: "u1",
                    pipeline_id: "p1",
                    activity_id: "hevy:hv-1",
                    source: "hevy",
                    external_id: "hv-1",
                    bypass_dedup: false,
                },
                now(),
            )
            .await
            .unwrap();
        assert_eq!(decision, Decision::Suppress(SuppressedReason::ReIngest));
    }

    #[tokio::test]
    async fn bypass_dedup_allows_even_with_existing_success() {
        let (gate, store) = gate();
        let ledger = Ledger::new(store);
        let mut run = PipelineRun::new("exec-1".into(), "u1".into(), "p1".into(), "hevy:hv-1".into(), "hevy".into(), now());
        run.status = RunStatus::Success;
        ledger.create(&run).await.unwrap();

        let decision = gate
            .evaluate(
                &DedupRequest {
                    user_id: "u1",
                    pipeline_id: "p1",
                    activity_id: "hevy:hv-1",
                    source: "hevy",
                    external_id: "hv-1",
                    bypass_dedup: true,
                },
                now(),
            )
            .await
            .unwrap();
        assert_eq!(decision, Decision::Allow);
    }
}
