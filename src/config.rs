//! Configuration module for ivfstore.
//!
//! This module provides a layered configuration system that supports:
//! - Default values
//! - TOML configuration file
//! - Environment variable overrides
//!
//! # Environment Variables
//!
//! Environment variables must be prefixed with `IVF_` and use double underscores
//! to separate nested levels:
//! - `IVF_BUILD__PARALLEL_THREADS=8` sets `build.parallel_threads`
//! - `IVF_SERVING__PER_FILE_TARGET=5000` sets `serving.per_file_target`
//! - `IVF_LOG_LEVEL=debug` sets `log_level`

use crate::dnc::BuildConfig;
use crate::metadata::MetadataConfig;
use crate::serving::ServingConfig;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const CONFIG_DIR: &str = ".ivfstore";
const CONFIG_FILE: &str = "settings.toml";

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Settings {
    /// Version of the configuration schema
    #[serde(default = "default_version")]
    pub version: u32,

    /// Directory holding the serving cache files
    #[serde(default = "default_cache_path")]
    pub cache_path: PathBuf,

    /// Directory for divide-and-conquer scratch files
    #[serde(default = "default_scratch_path")]
    pub scratch_path: PathBuf,

    /// Log level used when `RUST_LOG` is not set
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Divide-and-conquer builder settings
    #[serde(default)]
    pub build: BuildSettings,

    /// Serving cache settings
    #[serde(default)]
    pub serving: ServingConfig,

    /// Metadata cache settings
    #[serde(default)]
    pub metadata: MetadataConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct BuildSettings {
    /// Datasets at or below this many rows become leaves
    #[serde(default = "default_leaf_size")]
    pub leaf_size: u64,

    /// Maximum children per split
    #[serde(default = "default_split_factor")]
    pub split_factor: usize,

    /// Rows sampled per split
    #[serde(default = "default_sample_size")]
    pub sample_size: usize,

    /// Rows routed per similarity call while partitioning
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Number of build worker threads
    #[serde(default = "default_parallel_threads")]
    pub parallel_threads: usize,

    /// Leaves smaller than `leaf_size * min_leaf_fraction` are merged away
    #[serde(default = "default_min_leaf_fraction")]
    pub min_leaf_fraction: f64,
}

fn default_version() -> u32 {
    1
}
fn default_cache_path() -> PathBuf {
    PathBuf::from(".ivfstore/cache")
}
fn default_scratch_path() -> PathBuf {
    PathBuf::from(".ivfstore/scratch")
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_leaf_size() -> u64 {
    10_000
}
fn default_split_factor() -> usize {
    2
}
fn default_sample_size() -> usize {
    50_000
}
fn default_batch_size() -> usize {
    crate::vector::BATCH_SIZE
}
fn default_parallel_threads() -> usize {
    num_cpus::get()
}
fn default_min_leaf_fraction() -> f64 {
    0.1
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: default_version(),
            cache_path: default_cache_path(),
            scratch_path: default_scratch_path(),
            log_level: default_log_level(),
            build: BuildSettings::default(),
            serving: ServingConfig::default(),
            metadata: MetadataConfig::default(),
        }
    }
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            leaf_size: default_leaf_size(),
            split_factor: default_split_factor(),
            sample_size: default_sample_size(),
            batch_size: default_batch_size(),
            parallel_threads: default_parallel_threads(),
            min_leaf_fraction: default_min_leaf_fraction(),
        }
    }
}

impl BuildSettings {
    /// Builder configuration with an optional reproducibility seed.
    #[must_use]
    pub fn to_build_config(&self, seed: Option<u64>) -> BuildConfig {
        BuildConfig {
            leaf_size: self.leaf_size,
            split_factor: self.split_factor,
            sample_size: self.sample_size,
            parallel_threads: self.parallel_threads,
            batch_size: self.batch_size.max(1),
            seed,
        }
    }

    /// Row count below which a leaf is merged into its nearest neighbour.
    #[must_use]
    pub fn min_leaf_rows(&self) -> u64 {
        (self.leaf_size as f64 * self.min_leaf_fraction.clamp(0.0, 1.0)).round() as u64
    }
}

impl Settings {
    /// Load configuration from all sources
    pub fn load() -> Result<Self, Box<figment::Error>> {
        let config_path = Self::find_workspace_config()
            .unwrap_or_else(|| Path::new(CONFIG_DIR).join(CONFIG_FILE));
        Self::load_from(config_path)
    }

    /// Load configuration from a specific file, still honouring `IVF_` overrides
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, Box<figment::Error>> {
        Figment::new()
            // Start with defaults
            .merge(Serialized::defaults(Settings::default()))
            // Layer in config file if it exists
            .merge(Toml::file(path.as_ref()))
            // Double underscore separates nested levels, single underscores stay
            .merge(Env::prefixed("IVF_").map(|key| {
                key.as_str()
                    .to_lowercase()
                    .replace("__", ".")
                    .into()
            }))
            .extract()
            .map_err(Box::new)
    }

    /// Find the settings file by looking for a .ivfstore directory
    /// from the current directory up to the root
    fn find_workspace_config() -> Option<PathBuf> {
        let current = std::env::current_dir().ok()?;

        for ancestor in current.ancestors() {
            let config_dir = ancestor.join(CONFIG_DIR);
            if config_dir.is_dir() {
                return Some(config_dir.join(CONFIG_FILE));
            }
        }

        None
    }

    /// Save current configuration to file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), Box<dyn std::error::Error>> {
        let parent = path.as_ref().parent().ok_or("Invalid path")?;
        std::fs::create_dir_all(parent)?;

        let toml_string = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_string)?;

        Ok(())
    }

    /// Render as TOML for display
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// Create a default settings file with helpful comments
    pub fn init_config_file(force: bool) -> Result<PathBuf, Box<dyn std::error::Error>> {
        let config_path = Path::new(CONFIG_DIR).join(CONFIG_FILE);

        if !force && config_path.exists() {
            return Err("Configuration file already exists. Use --force to overwrite".into());
        }

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let template = format!(
            r#"# ivfstore configuration file

# Version of the configuration schema
version = 1

# Serving cache files (relative to the working directory)
cache_path = ".ivfstore/cache"

# Scratch space for divide-and-conquer builds
scratch_path = ".ivfstore/scratch"

# Log level when RUST_LOG is not set (error, warn, info, debug, trace)
log_level = "info"

[build]
# Datasets at or below this many rows become leaves
leaf_size = 10000

# Maximum children per split
split_factor = 2

# Rows sampled for each split and each representative centroid
sample_size = 50000

# Rows routed per similarity call while partitioning
batch_size = 1024

# Number of build worker threads (defaults to CPU count)
# parallel_threads = {threads}

# Leaves below leaf_size * min_leaf_fraction rows are merged into a neighbour
min_leaf_fraction = 0.1

[serving]
# Target rows per centroid file
per_file_target = 10000

# Corpora below per_file_target * min_centroid_files rows use one flat file
min_centroid_files = 2

# Step size of the streaming IVF update, in (0, 1]
learning_rate = 0.01

# Rows read from the source per page
page_size = 1000

# Pages in flight between the loader and the IVF trainer
queue_size = 4

# Centroid files scanned per query
default_centroids = 4

[metadata]
# Lifetime of cached owner, category and centroid lookups
ttl_ms = 5000

# How often expired lookups are swept
sweep_interval_ms = 15000
"#,
            threads = num_cpus::get()
        );

        std::fs::write(&config_path, template)?;
        Ok(config_path)
    }
}
