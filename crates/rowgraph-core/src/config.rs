//! Engine configuration.
//!
//! # Environment Variables
//!
//! [`EngineConfig::from_env`] reads:
//!
//! - `ROWGRAPH_BATCH_SIZE=<n>` - statements per grouped round trip (1 disables batching)
//! - `ROWGRAPH_DYNAMIC_UPDATE=1|0` - default for mappings without an explicit setting
//! - `ROWGRAPH_UNIQUE_RESULTS=1|0` - de-duplicate repeated root entities in list results

use crate::error::{Error, Result};
use std::env;

/// Configuration for query execution and mutation coordination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Maximum number of statements sent in one grouped round trip.
    pub batch_size: usize,
    /// Whether inserts of a flush are ordered parent tables first.
    pub order_inserts: bool,
    /// Whether updates bind only the changed columns when a mapping does
    /// not say otherwise.
    pub default_dynamic_update: bool,
    /// Whether list results drop repeated root entities produced by
    /// collection joins.
    pub unique_entity_results: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: 1,
            order_inserts: true,
            default_dynamic_update: false,
            unique_entity_results: true,
        }
    }
}

impl EngineConfig {
    /// Create a configuration with the given batch size.
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size,
            ..Default::default()
        }
    }

    /// Build a configuration from `ROWGRAPH_*` environment variables.
    ///
    /// Unset variables keep their defaults; malformed values are rejected.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(raw) = env::var("ROWGRAPH_BATCH_SIZE") {
            config.batch_size = raw.trim().parse().map_err(|_| {
                Error::config(format!("ROWGRAPH_BATCH_SIZE must be an integer, got '{raw}'"))
            })?;
        }
        if let Ok(raw) = env::var("ROWGRAPH_DYNAMIC_UPDATE") {
            config.default_dynamic_update = parse_flag("ROWGRAPH_DYNAMIC_UPDATE", &raw)?;
        }
        if let Ok(raw) = env::var("ROWGRAPH_UNIQUE_RESULTS") {
            config.unique_entity_results = parse_flag("ROWGRAPH_UNIQUE_RESULTS", &raw)?;
        }

        config.validate()?;
        tracing::debug!(?config, "Loaded engine configuration from environment");
        Ok(config)
    }

    /// Set the batch size.
    pub fn batch_size(mut self, n: usize) -> Self {
        self.batch_size = n;
        self
    }

    /// Set insert ordering.
    pub fn order_inserts(mut self, enabled: bool) -> Self {
        self.order_inserts = enabled;
        self
    }

    /// Set the dynamic-update default.
    pub fn default_dynamic_update(mut self, enabled: bool) -> Self {
        self.default_dynamic_update = enabled;
        self
    }

    /// Set root-entity de-duplication for list results.
    pub fn unique_entity_results(mut self, enabled: bool) -> Self {
        self.unique_entity_results = enabled;
        self
    }

    /// Whether grouped round trips are enabled.
    pub fn batching_enabled(&self) -> bool {
        self.batch_size > 1
    }

    /// Check the configuration for values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::config("batch_size must be at least 1"));
        }
        Ok(())
    }
}

fn parse_flag(name: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::config(format!("{name} must be a boolean flag, got '{raw}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_disable_batching() {
        let config = EngineConfig::default();
        assert_eq!(config.batch_size, 1);
        assert!(!config.batching_enabled());
        assert!(config.unique_entity_results);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn builder_chain() {
        let config = EngineConfig::new(50)
            .order_inserts(false)
            .default_dynamic_update(true)
            .unique_entity_results(false);
        assert!(config.batching_enabled());
        assert!(!config.order_inserts);
        assert!(config.default_dynamic_update);
        assert!(!config.unique_entity_results);
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        assert!(matches!(
            EngineConfig::new(0).validate(),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn flag_parsing() {
        assert!(parse_flag("X", "On").unwrap());
        assert!(!parse_flag("X", "0").unwrap());
        assert!(parse_flag("X", "maybe").is_err());
    }
}
