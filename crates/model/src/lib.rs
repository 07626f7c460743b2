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

//! Canonical activity shapes shared by every FitGlue stage worker: the
//! normalized activity a source ingest produces, the enriched event the
//! orchestrator hands to the router, and the small set of value enums
//! (activity kind, destination) the rest of the engine dispatches on.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod metadata_keys;

/// The closed enumeration of activity kinds the engine understands, with an
/// open fallback for source-specific kinds it doesn't (a pipeline can still
/// route and enrich an `Other` activity; only type-specific enrichers that
/// switch on the variant will skip it).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum ActivityType {
    /// Unspecified / not yet determined by any enricher.
    Unspecified,
    /// Running.
    Run,
    /// Cycling.
    Ride,
    /// Swimming.
    Swim,
    /// Walking.
    Walk,
    /// Hiking.
    Hike,
    /// Weight training / resistance training.
    StrengthTraining,
    /// Rowing.
    Rowing,
    /// Yoga.
    Yoga,
    /// High intensity interval training.
    Hiit,
    /// Elliptical trainer.
    Elliptical,
    /// A kind reported by a source that doesn't map to a known variant.
    Other(String),
}

impl Default for ActivityType {
    fn default() -> Self {
        ActivityType::Unspecified
    }
}

/// A third-party system the engine uploads enriched activities to.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum Destination {
    /// Strava.
    Strava,
    /// Garmin Connect.
    Garmin,
    /// TrainingPeaks.
    TrainingPeaks,
    /// A user-configured Google Sheets export.
    GoogleSheets,
    /// The public showcase page.
    Showcase,
    /// A destination identified only by its configuration key.
    Other(String),
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Destination::Strava => write!(f, "strava"),
            Destination::Garmin => write!(f, "garmin"),
            Destination::TrainingPeaks => write!(f, "training_peaks"),
            Destination::GoogleSheets => write!(f, "google_sheets"),
            Destination::Showcase => write!(f, "showcase"),
            Destination::Other(name) => write!(f, "{name}"),
        }
    }
}

/// A per-instant sample within a lap. A zero value denotes "absent" rather
/// than a sentinel, per the source model's invariant.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Record {
    /// Time of this sample.
    pub timestamp: DateTime<Utc>,
    /// Heart rate in bpm, 0 if absent.
    pub heart_rate: u32,
    /// Power in watts, 0 if absent.
    pub power: u32,
    /// Cadence in rpm/spm, 0 if absent.
    pub cadence: u32,
    /// Speed in m/s, 0 if absent.
    pub speed: f64,
    /// Altitude in meters, 0 if absent.
    pub altitude: f64,
    /// Latitude in degrees, 0 if absent.
    pub position_lat: f64,
    /// Longitude in degrees, 0 if absent.
    pub position_long: f64,
}

/// A lap within a session (for cardio activities) or an exercise block (for
/// strength activities with sets recorded as records).
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Lap {
    /// Start time of the lap.
    pub start_time: DateTime<Utc>,
    /// Elapsed time of the lap, in seconds.
    pub total_elapsed_time: f64,
    /// Distance covered during the lap, in meters.
    pub total_distance: f64,
    /// Exercise name, if this lap represents a named exercise.
    pub exercise_name: String,
    /// Non-strictly-increasing (by timestamp) samples within the lap.
    pub records: Vec<Record>,
}

/// A strength-training set (reps, weight, duration), distinct from a
/// cardio lap.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct StrengthSet {
    /// Name of the exercise performed.
    pub exercise_name: String,
    /// Start time of the set.
    pub start_time: DateTime<Utc>,
    /// Duration of the set, in seconds.
    pub duration_seconds: f64,
    /// Weight used, in kilograms, 0 if bodyweight/unknown.
    pub weight_kg: f64,
    /// Number of repetitions, 0 if not rep-based.
    pub reps: u32,
    /// Distance covered, in meters, for distance-based sets.
    pub distance_meters: f64,
    /// Set type (e.g. "working", "warmup", "failure").
    pub set_type: String,
    /// Primary muscle group targeted.
    pub primary_muscle_group: String,
}

/// A session within an activity (most activities have exactly one; some
/// multi-sport activities have several).
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Session {
    /// Start time of the session.
    pub start_time: DateTime<Utc>,
    /// Elapsed time of the session, in seconds.
    pub total_elapsed_time: f64,
    /// Distance covered, in meters.
    pub total_distance: f64,
    /// Calories burned, if known.
    pub total_calories: Option<f64>,
    /// Average heart rate across the session, if known.
    pub avg_hr: Option<u32>,
    /// Maximum heart rate across the session, if known.
    pub max_hr: Option<u32>,
    /// Cardio laps within the session.
    pub laps: Vec<Lap>,
    /// Strength sets within the session.
    pub strength_sets: Vec<StrengthSet>,
}

/// A labeled instant of interest within an activity (e.g. a split, a PR, a
/// pause).
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct TimeMarker {
    /// Time of the marker.
    pub timestamp: DateTime<Utc>,
    /// Human-readable label.
    pub label: String,
    /// Marker category (e.g. "split", "personal_record", "pause").
    pub marker_type: String,
}

/// The canonical, source-independent shape of a single workout/run/ride.
/// `source` + `external_id` uniquely identify the activity within a user.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct NormalizedActivity {
    /// The source system this activity arrived from (e.g. "hevy", "garmin").
    pub source: String,
    /// The source's own id for this activity.
    pub external_id: String,
    /// The FitGlue user this activity belongs to.
    pub user_id: String,
    /// Start time of the activity.
    pub start_time: DateTime<Utc>,
    /// Activity title.
    pub name: String,
    /// Activity kind.
    #[serde(rename = "type")]
    pub activity_type: ActivityType,
    /// Free-text description, accumulated by enrichers.
    pub description: String,
    /// Tags, deduplicated preserving first-seen order.
    pub tags: Vec<String>,
    /// One or more sessions (usually one).
    pub sessions: Vec<Session>,
    /// Time markers accumulated across sessions.
    pub time_markers: Vec<TimeMarker>,
}

/// Per-destination delivery status recorded on the `EnrichedActivityEvent`
/// as it is routed; the authoritative copy lives on the `PipelineRun`
/// ledger (see the `ledger` crate) and this is only the router's view when
/// constructing the outbound event.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DestinationStatus {
    /// Upload has not yet been attempted.
    Pending,
    /// Upload succeeded.
    Success,
    /// Upload failed.
    Failed,
    /// Upload was intentionally skipped (loop prevention, already delivered).
    Skipped,
}

/// A `NormalizedActivity` in flight through the pipeline, carrying the
/// enrichment accumulated so far plus pipeline/execution identifiers.
///
/// This is the payload of the `pipeline-activity`, `enriched-activity`, and
/// `upload-<destination>` bus topics (spec.md §6).
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct EnrichedActivityEvent {
    /// The normalized activity being carried through the pipeline.
    #[serde(flatten)]
    pub activity: NormalizedActivity,

    /// The pipeline configuration this execution is bound to.
    pub pipeline_id: String,
    /// Unique id for this end-to-end traversal of the pipeline.
    pub pipeline_execution_id: String,
    /// Destinations this event should be (or has been) routed to.
    pub destinations: Vec<Destination>,
    /// Flat string map of well-known enrichment keys (see `metadata_keys`).
    pub enrichment_metadata: HashMap<String, String>,
    /// Section headers written by enrichers so UPDATE-mode uploads can
    /// locate and replace the corresponding description block.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub description_section_headers: Vec<String>,
    /// Blob URI of a generated FIT file, if any enricher produced one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fit_file_uri: Option<String>,
    /// Blob URI of the original, unenriched payload (used by full-pipeline
    /// reposts).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_payload_uri: Option<String>,
    /// Blob URI this event itself was offloaded to, if it exceeded the
    /// inline size bound before being published.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enriched_event_uri: Option<String>,
    /// Bypasses both dedup suppressions when set (repost / explicit resend).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bypass_dedup: Option<bool>,
    /// Set when this event re-enters the orchestrator after a suspended
    /// pending input was resolved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_resume: Option<bool>,
    /// On resume, the single provider id to re-run (all other providers keep
    /// their prior results unchanged).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_only_enrichers: Option<Vec<String>>,
    /// Tells a destination worker to use its update (vs. create) path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_update_method: Option<bool>,
    /// The pending input id that triggered this resume, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_pending_input_id: Option<String>,
}

/// Normalizes a flat string-keyed map so that only one casing of a given
/// logical key survives: for every `camelCase` key with a `snake_case`
/// counterpart also present, the snake_case value wins and the camelCase
/// entry is dropped; a camelCase key with no snake_case counterpart is
/// rewritten to snake_case in place.
///
/// This is the single normalisation point called out in spec.md §9 — no
/// stage downstream of ingest should ever see both casings of the same
/// field.
pub fn normalize_casing(map: HashMap<String, String>) -> HashMap<String, String> {
    let mut normalized: HashMap<String, String> = HashMap::with_capacity(map.len());
    let mut camel_only: HashMap<String, String> = HashMap::new();

    for (key, value) in map {
        if is_snake_case(&key) {
            let _ = normalized.insert(key, value);
        } else {
            let _ = camel_only.insert(to_snake_case(&key), value);
        }
    }

    for (snake_key, value) in camel_only {
        let _ = normalized.entry(snake_key).or_insert(value);
    }

    normalized
}

fn is_snake_case(key: &str) -> bool {
    !key.chars().any(|c| c.is_ascii_uppercase())
}

fn to_snake_case(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 4);
    for c in key.chars() {
        if c.is_ascii_uppercase() {
            out.push('_');
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn activity_type_defaults_to_unspecified() {
        assert_eq!(ActivityType::default(), ActivityType::Unspecified);
    }

    #[test]
    fn destination_display_matches_config_key() {
        assert_eq!(Destination::Strava.to_string(), "strava");
        assert_eq!(Destination::Other("webhook-mirror".into()).to_string(), "webhook-mirror");
    }

    #[test]
    fn normalize_casing_prefers_snake_case_value() {
        let mut map = HashMap::new();
        let _ = map.insert("hrSource".to_string(), "camel".to_string());
        let _ = map.insert("hr_source".to_string(), "snake".to_string());

        let normalized = normalize_casing(map);

        assert_eq!(normalized.get("hr_source"), Some(&"snake".to_string()));
        assert_eq!(normalized.len(), 1);
    }

    #[test]
    fn normalize_casing_rewrites_lone_camel_case_key() {
        let mut map = HashMap::new();
        let _ = map.insert("assetRouteThumbnail".to_string(), "gs://bucket/x.png".to_string());

        let normalized = normalize_casing(map);

        assert_eq!(
            normalized.get("asset_route_thumbnail"),
            Some(&"gs://bucket/x.png".to_string())
        );
    }

    #[test]
    fn enriched_event_round_trips_through_json() {
        let mut event = EnrichedActivityEvent::default();
        event.activity.source = "hevy".into();
        event.activity.external_id = "hv-1".into();
        event.pipeline_execution_id = "exec-1".into();
        event.destinations = vec![Destination::Strava];
        let _ = event.enrichment_metadata.insert("hr_source".into(), "fit_file".into());

        let json = serde_json::to_string(&event).expect("serialize");
        let restored: EnrichedActivityEvent = serde_json::from_str(&json).expect("deserialize");

        assert_eq!(event, restored);
    }
}
