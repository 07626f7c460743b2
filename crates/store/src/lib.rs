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

//! Storage adapters: a blob store for large JSON artifacts (C1), a document
//! store with typed CRUD and atomic field updates (C2), a message bus of
//! named topics (C3), and the loop-prevention store built on top of the
//! document store (C4).
//!
//! Every adapter here is a trait plus an in-memory implementation. Real
//! backends (GCS, Firestore, Pub/Sub, or whatever a deployment picks) are
//! opaque to the core and live outside this crate.

pub mod blob;
pub mod bus;
pub mod document;
pub mod loop_prevention;

use thiserror::Error;

/// Errors shared across the storage adapters.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The requested blob or document does not exist.
    #[error("not found: {uri}")]
    NotFound {
        /// The blob URI or document path that was missing.
        uri: String,
    },

    /// A write was rejected because the target already exists and the
    /// operation required create-if-not-exists semantics.
    #[error("already exists: {uri}")]
    AlreadyExists {
        /// The blob URI or document path that already existed.
        uri: String,
    },

    /// The backend failed in a way the caller should treat as transient
    /// (surfaced so the bus redelivers the triggering message).
    #[error("transient storage failure on {uri}: {message}")]
    Transient {
        /// The blob URI or document path being accessed.
        uri: String,
        /// The underlying error message.
        message: String,
    },

    /// The stored bytes could not be decoded into the requested shape.
    #[error("corrupt document at {uri}: {message}")]
    Corrupt {
        /// The blob URI or document path being accessed.
        uri: String,
        /// The decode error message.
        message: String,
    },

    /// No subscriber is registered for the topic.
    #[error("unknown topic '{topic}'")]
    UnknownTopic {
        /// The topic name.
        topic: String,
    },
}
