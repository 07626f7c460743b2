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

//! Splitter (C7): given a normalized activity and its owning user, emits
//! one `PipelineActivityEvent` per active pipeline whose source matches
//! (spec.md §4.1).

use config::PipelineConfig;
use model::NormalizedActivity;
use serde::{Deserialize, Serialize};

/// The pre-enrichment event published to the `pipeline-activity` topic
/// (spec.md §6).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PipelineActivityEvent {
    /// The normalized activity being split into this pipeline.
    pub activity: NormalizedActivity,
    /// The pipeline this event is bound to.
    pub pipeline_id: String,
    /// A freshly generated identifier for this traversal of the pipeline.
    pub pipeline_execution_id: String,
    /// Passed through unchanged from the input, if already set.
    pub bypass_dedup: Option<bool>,
}

/// Generates a `pipeline_execution_id` of the form `<prefix>-<random>`
/// (spec.md §4.1).
pub fn new_pipeline_execution_id(prefix: &str) -> String {
    format!("{prefix}-{}", uuid::Uuid::new_v4())
}

/// Splits `activity` into one [`PipelineActivityEvent`] per pipeline in
/// `pipelines` that matches the activity's source and is not disabled.
/// Pipelines are evaluated in the order given (spec.md §4.1: "processed in
/// configuration order"); a disabled pipeline is skipped silently, a
/// pipeline with no destinations is skipped and logged.
pub fn split(activity: &NormalizedActivity, pipelines: &[PipelineConfig], bypass_dedup: Option<bool>) -> Vec<PipelineActivityEvent> {
    let mut events = Vec::new();

    for pipeline in pipelines {
        if pipeline.disabled {
            continue;
        }
        if pipeline.source != activity.source {
            continue;
        }
        if pipeline.destinations.is_empty() {
            tracing::info!(pipeline_id = %pipeline.id, "skipping pipeline with no destinations configured");
            continue;
        }

        events.push(PipelineActivityEvent {
            activity: activity.clone(),
            pipeline_id: pipeline.id.clone(),
            pipeline_execution_id: new_pipeline_execution_id("exec"),
            bypass_dedup,
        });
    }

    events
}
