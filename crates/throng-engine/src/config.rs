//! Engine configuration.
//!
//! Every config type is plain serde data with `#[serde(default)]`, so a JSON
//! document only needs to name the fields it changes:
//!
//! ```
//! use throng_engine::config::EngineConfig;
//!
//! let config = EngineConfig::from_json_str(
//!     r#"{ "launch": { "num_blocks": 2 }, "state": { "num_worlds": 16 } }"#,
//! ).unwrap();
//! assert_eq!(config.launch.num_blocks, 2);
//! assert_eq!(config.launch.lanes_per_group, 32);
//! assert_eq!(config.state.num_worlds, 16);
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use throng_ecs::state::StateConfig;

use crate::EngineError;

/// Widest lock-step group a [`LaneMask`](crate::worker::LaneMask) can describe.
pub const MAX_LANES_PER_GROUP: u32 = 64;

// ---------------------------------------------------------------------------
// LaunchConfig
// ---------------------------------------------------------------------------

/// Shape of the worker hierarchy: blocks of lock-step groups of lanes.
///
/// Every group is driven by one host thread, so a launch spawns
/// `num_blocks * groups_per_block` threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchConfig {
    pub num_blocks: u32,
    pub groups_per_block: u32,
    pub lanes_per_group: u32,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            num_blocks: 1,
            groups_per_block: 4,
            lanes_per_group: 32,
        }
    }
}

impl LaunchConfig {
    /// Lanes in one block.
    #[inline]
    pub fn block_threads(&self) -> u32 {
        self.groups_per_block * self.lanes_per_group
    }

    /// Groups across the whole launch.
    #[inline]
    pub fn total_groups(&self) -> u32 {
        self.num_blocks * self.groups_per_block
    }

    fn validate(&self) -> Result<(), EngineError> {
        if self.num_blocks == 0 {
            return Err(EngineError::invalid_config("num_blocks must be at least 1"));
        }
        if self.groups_per_block == 0 {
            return Err(EngineError::invalid_config(
                "groups_per_block must be at least 1",
            ));
        }
        if self.lanes_per_group == 0 || self.lanes_per_group > MAX_LANES_PER_GROUP {
            return Err(EngineError::invalid_config(format!(
                "lanes_per_group must be in 1..={MAX_LANES_PER_GROUP}, got {}",
                self.lanes_per_group
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// TraceConfig
// ---------------------------------------------------------------------------

/// Device trace buffer settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TraceConfig {
    pub enabled: bool,
    /// Records kept per run. Events past this are dropped and counted.
    pub capacity: u32,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: 1 << 16,
        }
    }
}

// ---------------------------------------------------------------------------
// EngineConfig
// ---------------------------------------------------------------------------

/// Everything needed to size and launch a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub state: StateConfig,
    pub launch: LaunchConfig,
    /// Bytes of per-replica data.
    pub world_data_bytes: u32,
    /// Alignment of each replica's data. Power of two.
    pub world_data_align: u32,
    /// Capacity of the per-run temporary allocator, in bytes.
    pub tmp_alloc_bytes: u64,
    /// Messages kept by the diagnostic print buffer per run.
    pub print_capacity: u32,
    pub trace: TraceConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            state: StateConfig::default(),
            launch: LaunchConfig::default(),
            world_data_bytes: 0,
            world_data_align: 16,
            tmp_alloc_bytes: 1 << 20,
            print_capacity: 1024,
            trace: TraceConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Parse and validate a JSON config.
    pub fn from_json_str(json: &str) -> Result<Self, EngineError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON config file.
    pub fn from_json_file(path: &Path) -> Result<Self, EngineError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Reject configurations that cannot be launched.
    pub fn validate(&self) -> Result<(), EngineError> {
        self.state.validate()?;
        self.launch.validate()?;
        if self.world_data_align == 0 || !self.world_data_align.is_power_of_two() {
            return Err(EngineError::invalid_config(format!(
                "world_data_align must be a power of two, got {}",
                self.world_data_align
            )));
        }
        Ok(())
    }

    /// Distance between consecutive replicas in the world data region.
    #[inline]
    pub fn world_data_stride(&self) -> u64 {
        let align = self.world_data_align as u64;
        (self.world_data_bytes as u64).div_ceil(align) * align
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
