//! Configuration for state histories
//!
//! Settings are plain serde types so they can be loaded from JSON, or from
//! TOML with the `toml` feature.
use serde::de::Error;
use serde::{Deserialize, Serialize};

/// History configuration
///
/// # Example
///
/// ```rust
/// use statehist::Config;
///
/// let config = Config::default().with_max_children(8);
/// assert!(config.validate().is_ok());
///
/// let json = r#"{ "block_size": 8192, "mipmap_resolution": 4 }"#;
/// let config = Config::from_json(json).unwrap();
/// assert_eq!(config.block_size, 8192);
/// assert_eq!(config.max_children, 50);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Size in bytes of one history tree node on disk
    #[serde(default = "Config::default_block_size")]
    pub block_size: usize,

    /// Maximum number of children of a core node
    #[serde(default = "Config::default_max_children")]
    pub max_children: usize,

    /// Version of the event-to-state logic that produced a history file.
    /// Files written under another version are refused on reopen.
    #[serde(default)]
    pub provider_version: u32,

    /// Number of decoded nodes kept in memory per history file
    #[serde(default = "Config::default_node_cache_size")]
    pub node_cache_size: usize,

    /// Spacing of full-state checkpoints in a partial history
    #[serde(default = "Config::default_checkpoint_interval")]
    pub checkpoint_interval: i64,

    /// Fan-in of each mipmap level
    #[serde(default = "Config::default_mipmap_resolution")]
    pub mipmap_resolution: usize,
}

impl Config {
    pub const MIN_BLOCK_SIZE: usize = 4 * 1024;

    const fn default_block_size() -> usize {
        64 * 1024
    }

    const fn default_max_children() -> usize {
        50
    }

    const fn default_node_cache_size() -> usize {
        256
    }

    const fn default_checkpoint_interval() -> i64 {
        50_000
    }

    const fn default_mipmap_resolution() -> usize {
        16
    }

    pub fn with_block_size(mut self, block_size: usize) -> Self {
        assert!(
            block_size >= Self::MIN_BLOCK_SIZE,
            "Block size must be at least 4 KiB"
        );
        self.block_size = block_size;
        self
    }

    pub fn with_max_children(mut self, max_children: usize) -> Self {
        assert!(max_children >= 2, "A core node needs at least two children");
        self.max_children = max_children;
        self
    }

    pub fn with_provider_version(mut self, version: u32) -> Self {
        self.provider_version = version;
        self
    }

    pub fn with_node_cache_size(mut self, size: usize) -> Self {
        self.node_cache_size = size;
        self
    }

    pub fn with_checkpoint_interval(mut self, interval: i64) -> Self {
        assert!(interval > 0, "Checkpoint interval must be positive");
        self.checkpoint_interval = interval;
        self
    }

    pub fn with_mipmap_resolution(mut self, resolution: usize) -> Self {
        assert!(resolution >= 2, "Mipmap resolution must be at least 2");
        if resolution > 1024 {
            log::warn!(
                "Mipmap resolution of {} leaves very few levels; range aggregates will scan raw intervals",
                resolution
            );
        }
        self.mipmap_resolution = resolution;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.block_size < Self::MIN_BLOCK_SIZE {
            return Err(format!(
                "Block size must be at least {} bytes",
                Self::MIN_BLOCK_SIZE
            ));
        }

        if self.block_size > u32::MAX as usize {
            return Err("Block size must fit in 32 bits".to_string());
        }

        if self.max_children < 2 {
            return Err("Max children must be at least 2".to_string());
        }

        // Core node child table must leave room for intervals.
        let child_table = self.max_children * crate::backend::history_tree::CHILD_ENTRY_SIZE;
        if child_table * 2 > self.block_size {
            return Err(format!(
                "{} children do not fit in a {} byte block",
                self.max_children, self.block_size
            ));
        }

        if self.checkpoint_interval <= 0 {
            return Err("Checkpoint interval must be positive".to_string());
        }

        if self.mipmap_resolution < 2 {
            return Err("Mipmap resolution must be at least 2".to_string());
        }

        Ok(())
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let config: Config = serde_json::from_str(json)?;
        if let Err(e) = config.validate() {
            return Err(Error::custom(e));
        }
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    #[cfg(feature = "toml")]
    pub fn from_toml(toml_str: &str) -> Result<Self, toml::de::Error> {
        let config: Config = toml::from_str(toml_str)?;
        if let Err(e) = config.validate() {
            return Err(toml::de::Error::custom(e));
        }
        Ok(config)
    }

    #[cfg(feature = "toml")]
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            block_size: Self::default_block_size(),
            max_children: Self::default_max_children(),
            provider_version: 0,
            node_cache_size: Self::default_node_cache_size(),
            checkpoint_interval: Self::default_checkpoint_interval(),
            mipmap_resolution: Self::default_mipmap_resolution(),
        }
    }
}
