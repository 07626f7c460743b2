//! Well-known keys used in `EnrichedActivityEvent::enrichment_metadata`.
//!
//! Enrichers are free to write arbitrary keys, but any key a downstream
//! stage or destination worker reads by name should be declared here so the
//! string only appears in one place.

/// Which source the heart-rate stream came from (e.g. "fit_file", "chest_strap").
pub const HR_SOURCE: &str = "hr_source";

/// Blob URI of a generated thumbnail image for the route/map.
pub const ASSET_ROUTE_THUMBNAIL: &str = "asset_route_thumbnail";

/// Blob URI of a generated elevation chart image.
pub const ASSET_ELEVATION_CHART: &str = "asset_elevation_chart";

/// Blob URI of a generated pace/heart-rate chart image.
pub const ASSET_PACE_CHART: &str = "asset_pace_chart";

/// JSON-encoded list of personal records detected for this activity.
pub const PERSONAL_RECORDS: &str = "personal_records";

/// Free-text weather summary attached by a weather enricher.
pub const WEATHER_SUMMARY: &str = "weather_summary";

/// Recovery/readiness advisory text.
pub const RECOVERY_ADVISORY: &str = "recovery_advisory";

/// Per-provider error message key, e.g. `"weather_error"` for provider id
/// `"weather"`. Written by the orchestrator when a provider fails but the
/// pipeline proceeds best-effort (spec.md §4.3 failure semantics).
pub fn provider_error(provider_id: &str) -> String {
    format!("{provider_id}_error")
}

/// Prefix for a section header metadata key recorded by an enricher so a
/// later UPDATE-mode upload can find and replace its block in the
/// description (spec.md §9 section-header matching).
pub fn section_header_key(provider_id: &str) -> String {
    format!("section_header_{provider_id}")
}

/// JSON-encoded per-destination plugin config a repost merges in from the
/// user's saved defaults, keyed by destination (spec.md §4.6 missed- and
/// retry-destination reposts).
pub fn destination_plugin_config(destination: &str) -> String {
    format!("destination_plugin_config_{destination}")
}

/// Flag an enricher sets to `"true"` when the destination equals the
/// activity's source but this event is itself a same-source update rather
/// than a would-be loop (spec.md §4.4 router exclusions).
pub fn same_source_destination(destination: &str) -> String {
    format!("same_source_destination_{destination}")
}
