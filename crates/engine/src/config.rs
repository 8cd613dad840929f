//! Database configuration via `tessera.toml`
//!
//! On first open, a default `tessera.toml` is written into the data
//! directory. To change settings, edit the file and reopen.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tessera_core::{Error, Result, SearchParams, DEFAULT_NLIST};
use tessera_storage::DurabilityMode;

/// Config file name placed in the database data directory.
pub const CONFIG_FILE_NAME: &str = "tessera.toml";

/// Database configuration loaded from `tessera.toml`.
///
/// # Example
///
/// ```toml
/// durability = "standard"
/// cache_capacity_mb = 1024
/// index_file_size_mb = 1024
/// default_nlist = 64
/// default_nprobe = 8
/// background_threads = 1
/// max_queue_depth = 64
/// auto_build = true
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Durability mode: `"standard"` or `"always"`.
    #[serde(default = "default_durability_str")]
    pub durability: String,
    /// Soft limit of the shared segment cache, in MiB.
    #[serde(default = "default_cache_capacity_mb")]
    pub cache_capacity_mb: usize,
    /// Raw segment size that triggers sealing, in MiB, for tables created
    /// without an explicit size.
    #[serde(default = "default_index_file_size_mb")]
    pub index_file_size_mb: usize,
    /// Cluster count used when an index request does not name one.
    #[serde(default = "default_nlist")]
    pub default_nlist: usize,
    /// Lists probed when a search does not name a count.
    #[serde(default = "default_nprobe")]
    pub default_nprobe: usize,
    /// Worker threads running background index builds.
    #[serde(default = "default_background_threads")]
    pub background_threads: usize,
    /// Pending background tasks before submissions are rejected.
    #[serde(default = "default_max_queue_depth")]
    pub max_queue_depth: usize,
    /// Build sealed segments in the background after inserts.
    #[serde(default = "default_auto_build")]
    pub auto_build: bool,
}

fn default_durability_str() -> String {
    "standard".to_string()
}

fn default_cache_capacity_mb() -> usize {
    1024
}

fn default_index_file_size_mb() -> usize {
    1024
}

fn default_nlist() -> usize {
    DEFAULT_NLIST
}

fn default_nprobe() -> usize {
    SearchParams::default().nprobe
}

fn default_background_threads() -> usize {
    1
}

fn default_max_queue_depth() -> usize {
    64
}

fn default_auto_build() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            durability: default_durability_str(),
            cache_capacity_mb: default_cache_capacity_mb(),
            index_file_size_mb: default_index_file_size_mb(),
            default_nlist: default_nlist(),
            default_nprobe: default_nprobe(),
            background_threads: default_background_threads(),
            max_queue_depth: default_max_queue_depth(),
            auto_build: default_auto_build(),
        }
    }
}

impl EngineConfig {
    /// Parse the durability string into a `DurabilityMode`.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not `"standard"` or `"always"`.
    pub fn durability_mode(&self) -> Result<DurabilityMode> {
        match self.durability.as_str() {
            "standard" => Ok(DurabilityMode::Standard),
            "always" => Ok(DurabilityMode::Always),
            other => Err(Error::invalid_input(format!(
                "Invalid durability mode '{}' in tessera.toml. Expected \"standard\" or \"always\".",
                other
            ))),
        }
    }

    /// Cache soft limit in bytes
    pub fn cache_capacity_bytes(&self) -> usize {
        self.cache_capacity_mb.saturating_mul(1 << 20)
    }

    /// Search parameters used when a request names none
    pub fn search_params(&self) -> SearchParams {
        SearchParams {
            nprobe: self.default_nprobe,
        }
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        self.durability_mode()?;
        for (name, value) in [
            ("index_file_size_mb", self.index_file_size_mb),
            ("default_nlist", self.default_nlist),
            ("default_nprobe", self.default_nprobe),
            ("background_threads", self.background_threads),
            ("max_queue_depth", self.max_queue_depth),
        ] {
            if value == 0 {
                return Err(Error::invalid_input(format!(
                    "{} in tessera.toml must be > 0",
                    name
                )));
            }
        }
        Ok(())
    }

    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# Tessera database configuration
#
# Durability mode: "standard" (default) or "always"
#   "standard" = flush every append to the OS, survives process crashes
#   "always"   = fsync every append, survives power loss
durability = "standard"

# Soft limit of the shared segment cache, in MiB.
# Pinned segments may push the cache over this limit temporarily.
cache_capacity_mb = 1024

# Raw segment size that triggers sealing, in MiB (tables may override).
index_file_size_mb = 1024

# Default IVF parameters.
default_nlist = 64
default_nprobe = 8

# Background index builds.
background_threads = 1
max_queue_depth = 64
auto_build = true
"#
    }

    /// Read and parse config from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::io(format!("read config file '{}'", path.display()), e))?;
        let config: EngineConfig = toml::from_str(&content).map_err(|e| {
            Error::invalid_input(format!(
                "Failed to parse config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Write the default config file if it does not already exist.
    pub fn write_default_if_missing(path: &Path) -> Result<()> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml()).map_err(|e| {
                Error::io(
                    format!("write default config file '{}'", path.display()),
                    e,
                )
            })?;
        }
        Ok(())
    }

    /// Serialize this config to TOML and write it to the given path.
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).map_err(|e| Error::Serialization {
            message: format!("Failed to serialize config: {}", e),
        })?;
        std::fs::write(path, content)
            .map_err(|e| Error::io(format!("write config file '{}'", path.display()), e))
    }

    /// Load `tessera.toml` from `dir`, writing the default first if absent.
    pub fn load_or_create(dir: &Path) -> Result<Self> {
        let path = dir.join(CONFIG_FILE_NAME);
        Self::write_default_if_missing(&path)?;
        Self::from_file(&path)
    }
}
