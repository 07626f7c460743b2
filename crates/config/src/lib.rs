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

//! Pipeline Configuration Store (C6): per-user ordered list of pipelines,
//! each binding one source, an ordered enricher list, a destination set,
//! and per-plugin config (spec.md §3). Also carries the process-wide
//! engine configuration (spec.md §6), loaded the way the teacher crate
//! loads its service configuration: `serde_yaml` into a typed struct with
//! `validator` derive checks.

use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use model::Destination;
use serde::{Deserialize, Serialize};
use store::document::{collections, get_as, put_as, DocumentStore};
use thiserror::Error;
use tracing::debug;
use validator::Validate;

/// Errors raised while loading or resolving configuration.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The config file could not be read or parsed.
    #[error("invalid configuration file `{file}` - {message}")]
    InvalidConfig {
        /// The path to the config file.
        file: String,
        /// The error message.
        message: String,
    },

    /// The loaded configuration failed validation.
    #[error("invalid configuration: {message}")]
    Validation {
        /// The validation error message.
        message: String,
    },

    /// No pipeline with the given id exists for the user.
    #[error("pipeline '{pipeline_id}' not found for user '{user_id}'")]
    PipelineNotFound {
        /// The user id.
        user_id: String,
        /// The pipeline id.
        pipeline_id: String,
    },

    /// The underlying store failed.
    #[error(transparent)]
    Store(#[from] store::Error),
}

/// Process-wide configuration surface (spec.md §6).
#[derive(Serialize, Deserialize, Debug, Clone, Validate)]
pub struct EngineConfig {
    /// Logical tenant / environment discriminator.
    pub project_id: String,

    /// Default bucket for run artifacts.
    pub blob_bucket_default: String,

    /// Public bucket for showcase assets.
    pub showcase_assets_bucket: String,

    /// Max concurrent providers per enricher phase.
    #[serde(default = "default_enricher_parallelism")]
    #[validate(range(min = 1, max = 64))]
    pub enricher_parallelism: usize,

    /// Per-provider soft deadline, in milliseconds.
    #[serde(default = "default_provider_deadline_ms")]
    #[validate(range(min = 1))]
    pub provider_deadline_ms: u64,

    /// Size above which an event is offloaded to the blob store, in bytes.
    #[serde(default = "default_payload_offload_bytes")]
    #[validate(range(min = 1))]
    pub payload_offload_bytes: usize,

    /// Recency window for bounceback suppression, in seconds.
    #[serde(default = "default_dedup_window_secs")]
    #[validate(range(min = 1))]
    pub dedup_window_secs: i64,
}

fn default_enricher_parallelism() -> usize {
    4
}

fn default_provider_deadline_ms() -> u64 {
    10_000
}

fn default_payload_offload_bytes() -> usize {
    256 * 1024
}

fn default_dedup_window_secs() -> i64 {
    15 * 60
}

impl EngineConfig {
    /// Loads and validates the engine configuration from a YAML file,
    /// following the teacher crate's `Config::load_with_factories` shape
    /// (read, deserialize, validate, log).
    pub fn load<P: AsRef<Path>>(config_file_path: P) -> Result<Self, Error> {
        let config_file_name = config_file_path.as_ref().display().to_string();
        debug!("loading {}", config_file_name);

        let config_file = File::open(&config_file_path).map_err(|err| Error::InvalidConfig {
            file: config_file_name.clone(),
            message: err.to_string(),
        })?;
        let reader = BufReader::new(config_file);
        let config: EngineConfig = serde_yaml::from_reader(reader).map_err(|err| Error::InvalidConfig {
            file: config_file_name.clone(),
            message: err.to_string(),
        })?;
        config.validate().map_err(|err| Error::Validation { message: err.to_string() })?;

        debug!("{} loaded", config_file_name);
        Ok(config)
    }
}

/// One enricher binding within a pipeline's ordered list (spec.md §3).
#[derive(Serialize, Deserialize, Debug, Clone, Validate)]
pub struct EnricherBinding {
    /// The provider type string resolved by `enricher::ProviderFactory`.
    #[validate(length(min = 1))]
    pub provider_type: String,

    /// Per-provider input configuration.
    #[serde(default)]
    pub inputs: HashMap<String, String>,
}

/// A per-user pipeline configuration (spec.md §3).
#[derive(Serialize, Deserialize, Debug, Clone, Validate)]
pub struct PipelineConfig {
    /// The pipeline's stable id.
    #[validate(length(min = 1))]
    pub id: String,

    /// A human-readable name.
    pub name: String,

    /// The source this pipeline accepts activities from.
    #[validate(length(min = 1))]
    pub source: String,

    /// Ordered enricher bindings.
    #[validate]
    pub enrichers: Vec<EnricherBinding>,

    /// Ordered destination set.
    pub destinations: Vec<Destination>,

    /// Source-specific configuration.
    #[serde(default)]
    pub source_config: HashMap<String, serde_json::Value>,

    /// Per-destination configuration, keyed by destination id.
    #[serde(default)]
    pub destination_configs: HashMap<String, HashMap<String, serde_json::Value>>,

    /// Gates whether the Splitter emits for this pipeline.
    #[serde(default)]
    pub disabled: bool,
}

/// The ordered list of pipelines owned by one user, as persisted in the
/// `pipeline_configs` collection.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
struct UserPipelines {
    user_id: String,
    pipelines: Vec<PipelineConfig>,
}

/// Wraps a [`DocumentStore`] with the pipeline configuration read/write
/// contract. Order is preserved end to end since a user's pipelines are
/// stored as a single document containing the ordered `Vec`.
pub struct PipelineConfigStore {
    store: Arc<dyn DocumentStore>,
}

impl PipelineConfigStore {
    /// Wraps `store`.
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Returns the user's pipelines in configuration order, or an empty
    /// list if the user has none configured yet.
    pub async fn list_for_user(&self, user_id: &str) -> Result<Vec<PipelineConfig>, Error> {
        match get_as::<UserPipelines>(self.store.as_ref(), collections::USERS, user_id).await {
            Ok(user_pipelines) => Ok(user_pipelines.pipelines),
            Err(store::Error::NotFound { .. }) => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }

    /// Returns a single pipeline by id.
    pub async fn get(&self, user_id: &str, pipeline_id: &str) -> Result<PipelineConfig, Error> {
        self.list_for_user(user_id)
            .await?
            .into_iter()
            .find(|pipeline| pipeline.id == pipeline_id)
            .ok_or_else(|| Error::PipelineNotFound {
                user_id: user_id.to_string(),
                pipeline_id: pipeline_id.to_string(),
            })
    }

    /// Replaces the user's entire ordered pipeline list.
    pub async fn put_for_user(&self, user_id: &str, pipelines: Vec<PipelineConfig>) -> Result<(), Error> {
        let doc = UserPipelines {
            user_id: user_id.to_string(),
            pipelines,
        };
        put_as(self.store.as_ref(), collections::USERS, user_id, &doc).await?;
        Ok(())
    }

    /// Returns the default plugin configuration for a destination, used by
    /// the Resume Controller's missed-destination repost (spec.md §4.6):
    /// the pipeline's own `destination_configs` entry if one exists,
    /// falling back to the user's saved cross-pipeline default for that
    /// destination (best-effort; an absent default is not an error).
    pub async fn destination_defaults(
        &self,
        user_id: &str,
        pipeline_id: &str,
        destination: &Destination,
    ) -> Result<HashMap<String, serde_json::Value>, Error> {
        let pipeline = self.get(user_id, pipeline_id).await?;
        if let Some(configured) = pipeline.destination_configs.get(&destination.to_string()) {
            return Ok(configured.clone());
        }
        self.user_destination_default(user_id, destination).await
    }

    /// Reads a user's saved cross-pipeline default plugin config for a
    /// destination from the `plugin_defaults` collection.
    pub async fn user_destination_default(
        &self,
        user_id: &str,
        destination: &Destination,
    ) -> Result<HashMap<String, serde_json::Value>, Error> {
        let id = format!("{user_id}:{destination}");
        match get_as::<HashMap<String, serde_json::Value>>(self.store.as_ref(), collections::PLUGIN_DEFAULTS, &id).await {
            Ok(defaults) => Ok(defaults),
            Err(store::Error::NotFound { .. }) => Ok(HashMap::new()),
            Err(err) => Err(err.into()),
        }
    }

    /// Saves a user's cross-pipeline default plugin config for a
    /// destination.
    pub async fn set_user_destination_default(
        &self,
        user_id: &str,
        destination: &Destination,
        defaults: HashMap<String, serde_json::Value>,
    ) -> Result<(), Error> {
        let id = format!("{user_id}:{destination}");
        put_as(self.store.as_ref(), collections::PLUGIN_DEFAULTS, &id, &defaults).await?;
        Ok(())
    }
}
