//! Engine configuration
//!
//! Loaded from TOML with full defaults, so an empty document is a valid
//! configuration. Unknown keys are rejected rather than silently ignored.

use serde::{Deserialize, Serialize};
use std::path::Path;
use strata_core::{CodecSpec, EngineError};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Reservoir size per partition during coercion sampling
    pub sample_per_partition: usize,
    /// Global cap on sampled keys across all partitions
    pub max_global_samples: usize,
    /// Import warnings logged per partition before suppression
    pub warn_cap_per_partition: usize,
    /// Codec used by `write` when none is given
    pub default_codec: CodecSpec,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            sample_per_partition: 100,
            max_global_samples: 1_000_000,
            warn_cap_per_partition: 10,
            default_codec: CodecSpec::zstd(None),
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(s: &str) -> Result<EngineConfig, EngineError> {
        toml::from_str(s).map_err(|e| EngineError::user(format!("bad engine config: {}", e)))
    }

    pub fn from_path(path: &Path) -> Result<EngineConfig, EngineError> {
        let text = std::fs::read_to_string(path)?;
        EngineConfig::from_toml_str(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_is_defaults() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config.sample_per_partition, 100);
        assert_eq!(config.max_global_samples, 1_000_000);
    }

    #[test]
    fn test_overrides() {
        let config = EngineConfig::from_toml_str(
            "sample_per_partition = 7\n\n[default_codec]\nid = \"gzip\"\nlevel = 9\n",
        )
        .unwrap();
        assert_eq!(config.sample_per_partition, 7);
        assert_eq!(config.default_codec, CodecSpec::gzip(Some(9)));
    }

    #[test]
    fn test_unknown_key_rejected() {
        assert!(EngineConfig::from_toml_str("zzz = 1").is_err());
    }
}
