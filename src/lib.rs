#![doc = include_str!("../README.md")]
#![deny(trivial_numeric_casts, missing_docs, unsafe_code, unstable_features, unused_import_braces, unused_qualifications, unused_extern_crates, unused_results, variant_size_differences)]
#![warn(rust_2021_compatibility, unreachable_pub)]

//! `fitglue` wires together the stage-worker crates that make up the
//! activity pipeline engine: ingest, deduplicate, enrich, route, and track
//! delivery to third-party destinations. Each re-exported crate below is a
//! self-contained component; this crate exists to give callers a single
//! dependency and a place to wire `engine::Worker` instances together. See
//! `README.md` for the stage diagram and `DESIGN.md` for how each piece is
//! grounded.

pub use audit;
pub use config;
pub use dedup;
pub use engine;
pub use enricher;
pub use ledger;
pub use model;
pub use pending_input;
pub use resume;
pub use router;
pub use splitter;
pub use store;
pub use task;
pub use upload;
