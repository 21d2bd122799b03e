// Engine configuration. One struct per concern, aggregated here;
// serde-loadable so the out-of-scope serving surface can deserialize it from
// whatever it reads.

use crate::cache::CacheConfig;
use crate::error::Result;
use crate::execution::AdaptiveSettings;
use crate::federation::FederationConfig;
use crate::optimizer::OptimizerConfig;
use crate::resource::ResourceConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub resources: ResourceConfig,
    pub cache: CacheConfig,
    pub optimizer: OptimizerConfig,
    pub federation: FederationConfig,
    pub adaptive: AdaptiveSettings,
    /// Record audit events (the trail itself is always bounded).
    pub audit_enabled: bool,
    pub audit_capacity: usize,
    /// Rows per batch between operators.
    pub batch_size: usize,
    /// Directory for sort runs and join partitions.
    pub spill_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            resources: ResourceConfig::default(),
            cache: CacheConfig::default(),
            optimizer: OptimizerConfig::default(),
            federation: FederationConfig::default(),
            adaptive: AdaptiveSettings::default(),
            audit_enabled: true,
            audit_capacity: 4_096,
            batch_size: crate::common::DEFAULT_BATCH_ROWS,
            spill_dir: std::env::temp_dir().join("lakefed"),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        self.resources.validate()?;
        self.cache.validate()?;
        if self.batch_size == 0 {
            return Err(crate::error::EngineError::Validation(
                "batch_size must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_config_round_trips_through_json() {
        let config = EngineConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.batch_size, config.batch_size);
        assert_eq!(
            back.resources.max_concurrent_queries,
            config.resources.max_concurrent_queries
        );
    }
}
