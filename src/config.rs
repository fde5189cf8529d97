//! Runtime configuration for tiered-pager.
//!
//! Configuration can be loaded from a JSON file or constructed programmatically.
//! All tier-related knobs (ceilings, compression effort, backing file location,
//! worker mode) live here.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Per-tier byte ceilings.
    pub tiers: TierConfig,

    /// Compression settings for the compressed tier.
    pub compression: CompressionConfig,

    /// Where the disk tier keeps its backing file.
    pub backing_store: BackingStoreConfig,

    /// Page sizing and background worker settings.
    pub paging: PagingConfig,
}

/// Byte ceilings for each residency tier.
///
/// `None` means unbounded. For the compressed tier, `Some(0)` disables the
/// tier entirely: evicted resident pages go straight to disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TierConfig {
    /// Maximum bytes held uncompressed in RAM.
    pub max_resident: Option<usize>,

    /// Maximum bytes held compressed in RAM.
    pub max_compressed: Option<usize>,

    /// Maximum bytes written to the backing file.
    pub max_disk: Option<usize>,
}

impl Default for TierConfig {
    fn default() -> Self {
        Self {
            max_resident: None,
            max_compressed: Some(0),
            max_disk: None,
        }
    }
}

impl TierConfig {
    /// Whether the compressed tier takes part in the eviction ladder.
    pub fn compressed_enabled(&self) -> bool {
        self.max_compressed != Some(0)
    }
}

/// Compression settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    /// zstd compression level (1-22). Higher is slower but smaller.
    pub level: i32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self { level: 1 }
    }
}

/// Backing file location.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackingStoreConfig {
    /// Directory for the backing file. Empty or unusable falls back to the
    /// platform temp directory.
    pub directory: Option<PathBuf>,

    /// Filename prefix; a sequence number and `.dat` are appended.
    pub prefix: String,
}

impl Default for BackingStoreConfig {
    fn default() -> Self {
        Self {
            directory: None,
            prefix: "tp_page_".to_string(),
        }
    }
}

/// Paging behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PagingConfig {
    /// Run tier transitions on a background worker thread. When false, every
    /// transition runs inline on the requesting thread.
    pub background_worker: bool,

    /// Size of a freshly created page when the request is smaller.
    pub default_page_size: usize,
}

impl Default for PagingConfig {
    fn default() -> Self {
        Self {
            background_worker: true,
            default_page_size: 4 * 1024 * 1024, // 4 MB
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }

    /// Ceiling for the resident tier as an LRU budget.
    pub fn resident_budget(&self) -> usize {
        self.tiers.max_resident.unwrap_or(usize::MAX)
    }

    /// Ceiling for the compressed tier as an LRU budget.
    pub fn compressed_budget(&self) -> usize {
        self.tiers.max_compressed.unwrap_or(usize::MAX)
    }

    /// Ceiling for the backing file.
    pub fn disk_budget(&self) -> usize {
        self.tiers.max_disk.unwrap_or(usize::MAX)
    }
}
