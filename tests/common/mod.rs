//! Shared fixtures for the scenario integration tests (spec.md §8 S1-S6):
//! a fixed clock, minimal pipeline/activity builders, a handful of test
//! `EnrichmentProvider`s, and `UploadWorker`s that always succeed. Each
//! scenario test wires these through the real stage crates end to end
//! over in-memory adapters.

#![allow(dead_code)]

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use config::{EnricherBinding, EngineConfig, PipelineConfig};
use enricher::provider::{EnrichmentProvider, EnrichmentResult, ProviderError, ProviderFactory, ResumeInput};
use model::{Destination, EnrichedActivityEvent, Lap, NormalizedActivity, Record, Session};
use upload::{UploadAttempt, UploadWorker};

/// A fixed instant every scenario test builds its fixtures against.
pub fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 1, 9, 0, 0).unwrap()
}

/// Process configuration with generous deadlines/parallelism for tests.
pub fn engine_config() -> EngineConfig {
    EngineConfig {
        project_id: "test".to_string(),
        blob_bucket_default: "bucket".to_string(),
        showcase_assets_bucket: "showcase".to_string(),
        enricher_parallelism: 4,
        provider_deadline_ms: 5_000,
        payload_offload_bytes: 1_000_000,
        dedup_window_secs: 900,
    }
}

/// A single-source pipeline bound to `enrichers` and `destinations`.
pub fn pipeline(id: &str, enrichers: Vec<&str>, destinations: Vec<Destination>) -> PipelineConfig {
    PipelineConfig {
        id: id.to_string(),
        name: id.to_string(),
        source: "hevy".to_string(),
        enrichers: enrichers
            .into_iter()
            .map(|provider_type| EnricherBinding {
                provider_type: provider_type.to_string(),
                inputs: HashMap::new(),
            })
            .collect(),
        destinations,
        source_config: HashMap::new(),
        destination_configs: HashMap::new(),
        disabled: false,
    }
}

/// A normalized activity with one session, one lap, and one heart-rate
/// sample per entry in `samples`.
pub fn activity_with_hr_samples(external_id: &str, samples: Vec<u32>) -> NormalizedActivity {
    NormalizedActivity {
        source: "hevy".to_string(),
        external_id: external_id.to_string(),
        user_id: "u1".to_string(),
        start_time: now(),
        name: "Morning session".to_string(),
        sessions: vec![Session {
            start_time: now(),
            laps: vec![Lap {
                start_time: now(),
                records: samples
                    .into_iter()
                    .map(|heart_rate| Record {
                        timestamp: now(),
                        heart_rate,
                        ..Default::default()
                    })
                    .collect(),
                ..Default::default()
            }],
            ..Default::default()
        }],
        ..Default::default()
    }
}

/// Summarizes heart rate across every record, matching scenario S1's
/// expected `"HR: 120-140 avg 130"` shape.
pub struct HeartRateSummaryProvider;

#[async_trait]
impl EnrichmentProvider for HeartRateSummaryProvider {
    fn id(&self) -> &str {
        "heart-rate-summary"
    }

    fn provider_type(&self) -> &str {
        "heart-rate-summary"
    }

    async fn enrich(&self, activity: &NormalizedActivity, _inputs: &HashMap<String, String>, _do_not_retry: bool) -> Result<EnrichmentResult, ProviderError> {
        let samples: Vec<u32> = activity
            .sessions
            .iter()
            .flat_map(|session| session.laps.iter())
            .flat_map(|lap| lap.records.iter())
            .map(|record| record.heart_rate)
            .filter(|hr| *hr > 0)
            .collect();
        if samples.is_empty() {
            return Ok(EnrichmentResult::default());
        }
        let min = *samples.iter().min().expect("non-empty");
        let max = *samples.iter().max().expect("non-empty");
        let avg = samples.iter().sum::<u32>() / samples.len() as u32;

        let mut metadata = HashMap::new();
        let _ = metadata.insert("hr_summary_status".to_string(), "success".to_string());
        Ok(EnrichmentResult {
            description: Some(format!("HR: {min}-{max} avg {avg}")),
            section_header: Some("## Heart Rate".to_string()),
            metadata,
            ..Default::default()
        })
    }
}

/// Always suspends on the first pass, asking for a parkrun position, then
/// appends it to the description on resume.
pub struct ParkrunProvider;

#[async_trait]
impl EnrichmentProvider for ParkrunProvider {
    fn id(&self) -> &str {
        "parkrun"
    }

    fn provider_type(&self) -> &str {
        "parkrun"
    }

    async fn enrich(&self, _activity: &NormalizedActivity, _inputs: &HashMap<String, String>, _do_not_retry: bool) -> Result<EnrichmentResult, ProviderError> {
        Err(ProviderError::WaitForInput {
            required_fields: vec!["position".to_string()],
            metadata: HashMap::new(),
        })
    }

    async fn enrich_resume(&self, _activity: &NormalizedActivity, _inputs: &HashMap<String, String>, resume: ResumeInput<'_>) -> Result<EnrichmentResult, ProviderError> {
        let position = resume.input_data.get("position").cloned().unwrap_or_default();
        Ok(EnrichmentResult {
            description: Some(format!("Position: {position}")),
            ..Default::default()
        })
    }
}

/// Always halts the pipeline with a fixed reason.
pub struct HaltingProvider;

#[async_trait]
impl EnrichmentProvider for HaltingProvider {
    fn id(&self) -> &str {
        "indoor-filter"
    }

    fn provider_type(&self) -> &str {
        "indoor-filter"
    }

    async fn enrich(&self, _activity: &NormalizedActivity, _inputs: &HashMap<String, String>, _do_not_retry: bool) -> Result<EnrichmentResult, ProviderError> {
        Ok(EnrichmentResult {
            halt_pipeline: true,
            halt_reason: Some("filtered: indoor cycling".to_string()),
            ..Default::default()
        })
    }
}

/// A deferred-phase provider that appends a fixed tag, used to exercise
/// the two-phase fan-out's deferred pass.
pub struct DeferredTagProvider;

#[async_trait]
impl EnrichmentProvider for DeferredTagProvider {
    fn id(&self) -> &str {
        "deferred-tagger"
    }

    fn provider_type(&self) -> &str {
        "deferred-tagger"
    }

    fn should_defer(&self) -> bool {
        true
    }

    async fn enrich(&self, _activity: &NormalizedActivity, inputs: &HashMap<String, String>, _do_not_retry: bool) -> Result<EnrichmentResult, ProviderError> {
        let seen_description = inputs.get("enriched_description").cloned().unwrap_or_default();
        Ok(EnrichmentResult {
            tags: vec!["reviewed".to_string()],
            metadata: HashMap::from([("deferred_saw_description".to_string(), (!seen_description.is_empty()).to_string())]),
            ..Default::default()
        })
    }
}

/// Resolves every provider defined in this module by its `provider_type`.
pub struct TestProviderFactory;

impl ProviderFactory for TestProviderFactory {
    fn create(&self, provider_type: &str) -> Result<Box<dyn EnrichmentProvider>, String> {
        match provider_type {
            "heart-rate-summary" => Ok(Box::new(HeartRateSummaryProvider)),
            "parkrun" => Ok(Box::new(ParkrunProvider)),
            "indoor-filter" => Ok(Box::new(HaltingProvider)),
            "deferred-tagger" => Ok(Box::new(DeferredTagProvider)),
            other => Err(format!("unknown provider type '{other}'")),
        }
    }
}

/// Always reports SUCCESS with a fixed destination id.
pub struct AlwaysSucceedsWorker {
    pub destination: Destination,
    pub external_id: &'static str,
}

#[async_trait]
impl UploadWorker for AlwaysSucceedsWorker {
    fn destination(&self) -> Destination {
        self.destination.clone()
    }

    async fn upload(&self, _event: &EnrichedActivityEvent) -> UploadAttempt {
        UploadAttempt::success(self.external_id)
    }
}
