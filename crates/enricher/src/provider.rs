//! The provider contract (spec.md §4.3): an `EnrichmentProvider` inspects
//! one activity and proposes field-level changes, never mutates the
//! activity directly. Providers are resolved by type string through a
//! [`ProviderFactory`], the same dispatch-on-type-string shape the teacher
//! crate uses for its processor/exporter plugin resolution.

use std::collections::HashMap;

use async_trait::async_trait;
use model::{ActivityType, NormalizedActivity, TimeMarker};

/// A provider's proposed contribution to the activity being enriched.
/// Every field is additive or override-on-presence; absence (`None` /
/// empty) means "this provider had nothing to say about this field"
/// (spec.md §4.3 merge rules).
#[derive(Debug, Clone, Default)]
pub struct EnrichmentResult {
    /// Overrides the activity's type, if set to anything but `Unspecified`.
    pub activity_type: Option<ActivityType>,
    /// Appended to the accumulated description, separated by a blank line.
    pub description: Option<String>,
    /// A stable marker written immediately before `description`, so a later
    /// UPDATE-mode upload can find and replace this provider's block.
    pub section_header: Option<String>,
    /// Overrides the activity's name outright.
    pub name: Option<String>,
    /// Appended to the (possibly already-overridden) name.
    pub name_suffix: Option<String>,
    /// Tags to add; deduplicated against what's already accumulated.
    pub tags: Vec<String>,
    /// Per-instant heart rate samples (bpm); overwrites existing samples by
    /// index, last provider to contribute wins.
    pub heart_rate_stream: Option<Vec<u32>>,
    /// Per-instant power samples (watts).
    pub power_stream: Option<Vec<u32>>,
    /// Per-instant latitude samples (degrees).
    pub position_lat_stream: Option<Vec<f64>>,
    /// Per-instant longitude samples (degrees).
    pub position_long_stream: Option<Vec<f64>>,
    /// Time markers to append; reconciled against strength sets after all
    /// providers in a phase have run.
    pub time_markers: Vec<TimeMarker>,
    /// Generated FIT file bytes, offloaded to the blob store before
    /// publish; last provider to contribute wins.
    pub fit_file_content: Option<Vec<u8>>,
    /// Flat metadata keys to merge in (spec.md `metadata_keys`); later
    /// providers overwrite earlier ones on key collision.
    pub metadata: HashMap<String, String>,
    /// When set, the orchestrator stops running remaining providers and the
    /// run settles HALTED without reaching the router.
    pub halt_pipeline: bool,
    /// Human-readable reason for `halt_pipeline`.
    pub halt_reason: Option<String>,
}

/// A provider's view of a previously completed pending input, passed to
/// [`EnrichmentProvider::enrich_resume`].
pub struct ResumeInput<'a> {
    /// Field values the user or poller supplied.
    pub input_data: &'a HashMap<String, String>,
    /// Whether the supplied values came from a background poller rather
    /// than a human.
    pub auto_populated: bool,
}

/// Raised by [`EnrichmentProvider::enrich`] instead of returning a result.
#[derive(Debug, Clone)]
pub enum ProviderError {
    /// The provider cannot proceed without more information. Not treated as
    /// a failure: the orchestrator suspends the run instead of recording an
    /// error (spec.md §4.3 step 2).
    WaitForInput {
        /// Field names the caller must supply to unblock this provider.
        required_fields: Vec<String>,
        /// Opaque metadata (including any `display.*` keys) to surface
        /// alongside the prompt.
        metadata: HashMap<String, String>,
    },
    /// The provider failed for any other reason. Captured into
    /// `enrichment_metadata["<provider>_error"]`; the run continues
    /// (spec.md §7).
    Failed(String),
}

/// One pluggable enrichment step (spec.md §4.3).
#[async_trait]
pub trait EnrichmentProvider: Send + Sync {
    /// Stable identifier, used as the `<provider>` in metadata keys and as
    /// `enricher_provider_id` on a raised `PendingInput`.
    fn id(&self) -> &str;

    /// The type string this instance was constructed from.
    fn provider_type(&self) -> &str;

    /// Whether this provider runs in the deferred phase, after every
    /// non-deferred provider has merged (spec.md §4.3 two-phase execution):
    /// used by providers that synthesize from the accumulated description,
    /// e.g. a recovery advisory that reads the workout summary other
    /// providers wrote.
    fn should_defer(&self) -> bool {
        false
    }

    /// Inspects `activity` and proposes changes. `inputs` is the
    /// provider's static per-pipeline configuration (spec.md
    /// `EnricherBinding.inputs`); `do_not_retry` is set on a resumed,
    /// previously-failed run so the provider can skip expensive retries it
    /// already exhausted.
    async fn enrich(
        &self,
        activity: &NormalizedActivity,
        inputs: &HashMap<String, String>,
        do_not_retry: bool,
    ) -> Result<EnrichmentResult, ProviderError>;

    /// Re-runs this provider after its own suspension was resolved. The
    /// default implementation rejects resume, for providers that never
    /// raise `WaitForInput`.
    async fn enrich_resume(
        &self,
        _activity: &NormalizedActivity,
        _inputs: &HashMap<String, String>,
        _resume: ResumeInput<'_>,
    ) -> Result<EnrichmentResult, ProviderError> {
        Err(ProviderError::Failed(format!("{} does not support resume", self.id())))
    }
}

/// Resolves a provider type string to a constructed provider instance,
/// grounded on the teacher crate's `ProcessorFactory`/`ExporterFactory`
/// dispatch pattern (one factory per deployment, matching on
/// `EnricherBinding.provider_type`).
pub trait ProviderFactory: Send + Sync {
    /// Builds the provider named by `provider_type`. Per-pipeline `inputs`
    /// are passed separately, at each `enrich` call, so one constructed
    /// provider instance can be reused across pipelines.
    fn create(&self, provider_type: &str) -> Result<Box<dyn EnrichmentProvider>, String>;
}
