//! Declared-order merge of provider results into the activity being
//! enriched (spec.md §4.3 merge rules).

use model::{ActivityType, Lap, Record, Session};

use crate::provider::EnrichmentResult;

/// The working state one `EnricherOrchestrator::run` call accumulates
/// across both execution phases.
pub struct Accumulator {
    /// The activity being mutated in place, field by field, as each
    /// provider's result merges in.
    pub activity: model::NormalizedActivity,
    /// Flat metadata map, merged shallowly (later provider wins on
    /// collision), normalized once at the end of the run.
    pub metadata: std::collections::HashMap<String, String>,
    /// One entry per provider that wrote a `section_header`, in merge
    /// order.
    pub description_section_headers: Vec<String>,
    /// One raw description fragment per contributing provider, mirrored
    /// onto `PipelineRun.description_fragments` for the ledger's view.
    pub description_fragments: Vec<String>,
    /// Provider ids applied so far, in application order (mirrors
    /// `PipelineRun.applied_enrichers`).
    pub applied_enrichers: Vec<String>,
    /// Set if a fit file was produced by any provider, offloaded to the
    /// blob store before publish.
    pub fit_file_content: Option<Vec<u8>>,
}

/// Merges one provider's `result` into `acc`. Returns `Some(reason)` if
/// this result requests halting the pipeline (spec.md §4.3: "stops the
/// remaining enrichers ... does not publish").
pub fn merge_result(acc: &mut Accumulator, provider_id: &str, result: EnrichmentResult) -> Option<String> {
    if let Some(activity_type) = result.activity_type {
        if activity_type != ActivityType::Unspecified {
            acc.activity.activity_type = activity_type;
        }
    }

    if let Some(name) = result.name {
        acc.activity.name = name;
    }
    if let Some(suffix) = result.name_suffix {
        acc.activity.name.push_str(&suffix);
    }

    if let Some(description) = result.description {
        if !acc.activity.description.is_empty() {
            acc.activity.description.push_str("\n\n");
        }
        if let Some(header) = &result.section_header {
            acc.activity.description.push_str(header);
            acc.activity.description.push('\n');
            acc.description_section_headers.push(header.clone());
        }
        acc.activity.description.push_str(&description);
        acc.description_fragments.push(description);
    }

    for tag in result.tags {
        if !acc.activity.tags.contains(&tag) {
            acc.activity.tags.push(tag);
        }
    }

    if let Some(stream) = result.heart_rate_stream {
        apply_stream(&mut acc.activity, stream.len(), |record, value| record.heart_rate = value, stream);
    }
    if let Some(stream) = result.power_stream {
        apply_stream(&mut acc.activity, stream.len(), |record, value| record.power = value, stream);
    }
    if let Some(stream) = result.position_lat_stream {
        apply_stream(&mut acc.activity, stream.len(), |record, value| record.position_lat = value, stream);
    }
    if let Some(stream) = result.position_long_stream {
        apply_stream(&mut acc.activity, stream.len(), |record, value| record.position_long = value, stream);
    }

    acc.activity.time_markers.extend(result.time_markers);

    if result.fit_file_content.is_some() {
        acc.fit_file_content = result.fit_file_content;
    }

    acc.metadata.extend(result.metadata);
    acc.applied_enrichers.push(provider_id.to_string());

    if result.halt_pipeline {
        Some(result.halt_reason.unwrap_or_else(|| format!("{provider_id} halted the pipeline")))
    } else {
        None
    }
}

/// Overwrites one field on the first `len` records across all sessions and
/// laps, creating blank records if fewer than `len` exist yet (spec.md
/// §4.3: "last provider to contribute a given stream wins").
fn apply_stream<T: Copy>(activity: &mut model::NormalizedActivity, len: usize, set_field: impl Fn(&mut Record, T), values: Vec<T>) {
    ensure_records(activity, len);
    for (record, value) in records_mut(activity).zip(values) {
        set_field(record, value);
    }
}

fn ensure_records(activity: &mut model::NormalizedActivity, needed: usize) {
    if activity.sessions.is_empty() {
        activity.sessions.push(Session::default());
    }
    let session = activity.sessions.first_mut().expect("just ensured non-empty");
    if session.laps.is_empty() {
        session.laps.push(Lap::default());
    }
    let lap = session.laps.first_mut().expect("just ensured non-empty");
    while lap.records.len() < needed {
        let timestamp = lap.records.last().map(|r| r.timestamp).unwrap_or(activity.start_time);
        lap.records.push(Record {
            timestamp,
            ..Record::default()
        });
    }
}

fn records_mut(activity: &mut model::NormalizedActivity) -> impl Iterator<Item = &mut Record> {
    activity.sessions.iter_mut().flat_map(|session| session.laps.iter_mut()).flat_map(|lap| lap.records.iter_mut())
}

/// Fills in blank time marker labels from the strength set whose time
/// window contains the marker's timestamp (spec.md §4.3: a post-merge
/// reconciliation pass for markers raised before the exercise name
/// enricher that named them had run).
pub fn reconcile_time_markers(activity: &mut model::NormalizedActivity) {
    let windows: Vec<(chrono::DateTime<chrono::Utc>, chrono::DateTime<chrono::Utc>, String)> = activity
        .sessions
        .iter()
        .flat_map(|session| session.strength_sets.iter())
        .map(|set| {
            let end = set.start_time + chrono::Duration::seconds(set.duration_seconds as i64);
            (set.start_time, end, set.exercise_name.clone())
        })
        .collect();

    for marker in &mut activity.time_markers {
        if marker.label.is_empty() {
            if let Some((_, _, name)) = windows.iter().find(|(start, end, _)| marker.timestamp >= *start && marker.timestamp <= *end) {
                marker.label = name.clone();
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;

    use chrono::{TimeZone, Utc};
    use model::{NormalizedActivity, StrengthSet, TimeMarker};

    use super::*;

    fn accumulator() -> Accumulator {
        Accumulator {
            activity: NormalizedActivity::default(),
            metadata: HashMap::new(),
            description_section_headers: Vec::new(),
            description_fragments: Vec::new(),
            applied_enrichers: Vec::new(),
            fit_file_content: None,
        }
    }

    #[test]
    fn description_merge_prepends_section_header_and_joins_with_blank_line() {
        let mut acc = accumulator();
        acc.activity.description = "first block".to_string();

        let result = EnrichmentResult {
            description: Some("second block".to_string()),
            section_header: Some("## Weather".to_string()),
            ..Default::default()
        };
        assert!(merge_result(&mut acc, "weather", result).is_none());

        assert_eq!(acc.activity.description, "first block\n\n## Weather\nsecond block");
        assert_eq!(acc.description_section_headers, vec!["## Weather".to_string()]);
    }

    #[test]
    fn tags_are_deduplicated_preserving_first_seen_order() {
        let mut acc = accumulator();
        acc.activity.tags = vec!["pr".to_string()];

        let result = EnrichmentResult {
            tags: vec!["pr".to_string(), "hard-effort".to_string()],
            ..Default::default()
        };
        merge_result(&mut acc, "pr-tracker", result);

        assert_eq!(acc.activity.tags, vec!["pr".to_string(), "hard-effort".to_string()]);
    }

    #[test]
    fn heart_rate_stream_creates_records_when_none_exist() {
        let mut acc = accumulator();
        let result = EnrichmentResult {
            heart_rate_stream: Some(vec![120, 130, 140]),
            ..Default::default()
        };
        merge_result(&mut acc, "hr-source", result);

        let records = &acc.activity.sessions[0].laps[0].records;
        assert_eq!(records.len(), 3);
        assert_eq!(records[1].heart_rate, 130);
    }

    #[test]
    fn later_stream_overwrites_only_its_own_field() {
        let mut acc = accumulator();
        merge_result(
            &mut acc,
            "hr-source",
            EnrichmentResult {
                heart_rate_stream: Some(vec![120, 130]),
                ..Default::default()
            },
        );
        merge_result(
            &mut acc,
            "power-source",
            EnrichmentResult {
                power_stream: Some(vec![200, 210]),
                ..Default::default()
            },
        );

        let records = &acc.activity.sessions[0].laps[0].records;
        assert_eq!(records[0].heart_rate, 120);
        assert_eq!(records[0].power, 200);
    }

    #[test]
    fn halt_pipeline_flag_propagates() {
        let mut acc = accumulator();
        let halted = merge_result(
            &mut acc,
            "licence-check",
            EnrichmentResult {
                halt_pipeline: true,
                halt_reason: Some("subscription expired".to_string()),
                ..Default::default()
            },
        );
        assert_eq!(halted, Some("subscription expired".to_string()));
    }

    #[test]
    fn time_marker_reconciliation_fills_label_from_overlapping_strength_set() {
        let mut activity = NormalizedActivity::default();
        let start = Utc.with_ymd_and_hms(2026, 1, 1, 10, 0, 0).unwrap();
        activity.sessions.push(Session {
            strength_sets: vec![StrengthSet {
                exercise_name: "Bench Press".to_string(),
                start_time: start,
                duration_seconds: 60.0,
                ..Default::default()
            }],
            ..Default::default()
        });
        activity.time_markers.push(TimeMarker {
            timestamp: start + chrono::Duration::seconds(10),
            label: String::new(),
            marker_type: "set_start".to_string(),
        });

        reconcile_time_markers(&mut activity);

        assert_eq!(activity.time_markers[0].label, "Bench Press");
    }
}
