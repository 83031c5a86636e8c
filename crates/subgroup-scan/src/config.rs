use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Workgroup size used when none is configured, clamped to the device.
pub const DEFAULT_WORKGROUP_SIZE: u32 = 256;

/// Deepest dispatch hierarchy the engine plans by default. With `W = 256`
/// eight levels cover any 32-bit length several times over.
pub const DEFAULT_MAX_HIERARCHY_DEPTH: u32 = 8;

/// Knobs of an [`crate::Engine`].
///
/// Every field has a default, so a JSON file only needs the ones it changes:
///
/// ```json
/// { "workgroup_size": 128 }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Invocations per workgroup (`W`). Must be a multiple of the device's
    /// subgroup size. `None` picks the largest such multiple up to
    /// [`DEFAULT_WORKGROUP_SIZE`].
    pub workgroup_size: Option<u32>,
    pub max_hierarchy_depth: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workgroup_size: None,
            max_hierarchy_depth: DEFAULT_MAX_HIERARCHY_DEPTH,
        }
    }
}

impl EngineConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    #[must_use]
    pub fn workgroup_size(mut self, workgroup_size: u32) -> Self {
        self.workgroup_size = Some(workgroup_size);
        self
    }

    #[must_use]
    pub fn max_hierarchy_depth(mut self, max_hierarchy_depth: u32) -> Self {
        self.max_hierarchy_depth = max_hierarchy_depth;
        self
    }
}
