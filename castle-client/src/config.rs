//! Client-side tuning configuration (§10.3).
//!
//! Follows the reference agent's `config.rs` pattern: a `serde`-derived struct loaded from
//! TOML via `toml::from_str`, with an explicit validation pass. Unlike the reference agent,
//! a config file is optional here — `CastleOptions::default()` supplies built-ins so
//! `Connection::connect` never requires one.

use serde::Deserialize;

use crate::error::{CastleError, Result};

/// Ring sizing: capacity (power of two) and the number of stateful reservation slots.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct RingConfig {
    pub capacity: u32,
    pub n_stateful: u32,
}

impl Default for RingConfig {
    fn default() -> Self {
        RingConfig {
            capacity: castle_proto::constants::DEFAULT_RING_CAPACITY,
            n_stateful: castle_proto::constants::DEFAULT_N_STATEFUL,
        }
    }
}

impl RingConfig {
    fn validate(&self) -> Result<()> {
        if !self.capacity.is_power_of_two() {
            return Err(CastleError::InvalidArgument(format!(
                "ring.capacity {} is not a power of two",
                self.capacity
            )));
        }
        if self.n_stateful == 0 || self.n_stateful > self.capacity {
            return Err(CastleError::InvalidArgument(format!(
                "ring.n_stateful {} must be in 1..={}",
                self.n_stateful, self.capacity
            )));
        }
        Ok(())
    }
}

/// Shared-buffer pool sizing: the ascending list of size classes (§4.3).
#[derive(Debug, Deserialize, Clone)]
pub struct PoolConfig {
    pub size_classes: Vec<usize>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            size_classes: vec![
                4 * 1024,
                16 * 1024,
                64 * 1024,
                256 * 1024,
                1024 * 1024,
            ],
        }
    }
}

impl PoolConfig {
    fn validate(&self) -> Result<()> {
        if self.size_classes.is_empty() {
            return Err(CastleError::InvalidArgument(
                "pool.size_classes must not be empty".into(),
            ));
        }
        if self.size_classes.iter().any(|&s| s == 0) {
            return Err(CastleError::InvalidArgument(
                "pool.size_classes must not contain a zero-size class".into(),
            ));
        }
        let mut sorted = self.size_classes.clone();
        sorted.sort_unstable();
        sorted.dedup();
        if sorted != self.size_classes {
            return Err(CastleError::InvalidArgument(
                "pool.size_classes must be sorted ascending with no duplicates".into(),
            ));
        }
        Ok(())
    }
}

/// Top-level configuration bundle passed to [`crate::Connection::connect`].
#[derive(Debug, Deserialize, Clone, Default)]
pub struct CastleOptions {
    #[serde(default)]
    pub ring: RingConfig,
    #[serde(default)]
    pub pool: PoolConfig,
}

impl CastleOptions {
    /// Parses and validates options from a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let opts: CastleOptions =
            toml::from_str(s).map_err(|e| CastleError::InvalidArgument(e.to_string()))?;
        opts.ring.validate()?;
        opts.pool.validate()?;
        Ok(opts)
    }

    /// Reads and parses options from a file on disk.
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let s = std::fs::read_to_string(path)?;
        Self::from_toml_str(&s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let opts = CastleOptions::default();
        assert!(opts.ring.validate().is_ok());
        assert!(opts.pool.validate().is_ok());
    }

    #[test]
    fn parses_full_document() {
        let toml = r#"
            [ring]
            capacity = 256
            n_stateful = 8

            [pool]
            size_classes = [4096, 65536, 1048576]
        "#;
        let opts = CastleOptions::from_toml_str(toml).unwrap();
        assert_eq!(opts.ring.capacity, 256);
        assert_eq!(opts.ring.n_stateful, 8);
        assert_eq!(opts.pool.size_classes, vec![4096, 65536, 1048576]);
    }

    #[test]
    fn rejects_non_power_of_two_capacity() {
        let toml = "[ring]\ncapacity = 100\nn_stateful = 4\n";
        assert!(matches!(
            CastleOptions::from_toml_str(toml),
            Err(CastleError::InvalidArgument(_))
        ));
    }

    #[test]
    fn rejects_unsorted_size_classes() {
        let toml = "[pool]\nsize_classes = [65536, 4096]\n";
        assert!(matches!(
            CastleOptions::from_toml_str(toml),
            Err(CastleError::InvalidArgument(_))
        ));
    }

    #[test]
    fn rejects_n_stateful_above_capacity() {
        let toml = "[ring]\ncapacity = 16\nn_stateful = 32\n";
        assert!(matches!(
            CastleOptions::from_toml_str(toml),
            Err(CastleError::InvalidArgument(_))
        ));
    }
}
