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

//! Enricher Orchestrator (C9): the pipeline's hardest stage (spec.md §2).
//! Fans a `PipelineActivityEvent` out to every configured provider in two
//! bounded-parallel phases, merges their results in declared order, and
//! either publishes an `EnrichedActivityEvent`, suspends the run on a
//! provider's `WaitForInput`, or halts it outright.

mod merge;
pub mod orchestrator;
pub mod provider;

pub use orchestrator::{EnricherInbound, EnricherOrchestrator, Error, Outcome};
pub use provider::{EnrichmentProvider, EnrichmentResult, ProviderError, ProviderFactory, ResumeInput};
