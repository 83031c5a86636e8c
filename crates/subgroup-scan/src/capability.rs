//! Static description of a device's execution hierarchy.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

bitflags::bitflags! {
    /// Classes of subgroup instructions a device can execute.
    ///
    /// Mirrors the Vulkan `VkSubgroupFeatureFlagBits`, which is also how
    /// SPIR-V groups its `GroupNonUniform*` capabilities.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct SubgroupOperations: u32 {
        /// `subgroupElect`, `subgroupBarrier` and the subgroup builtins.
        ///
        /// Requires Capability `GroupNonUniform`.
        const BASIC = 1 << 0;
        /// `subgroupAll`, `subgroupAny`, `subgroupAllEqual`.
        const VOTE = 1 << 1;
        /// Reductions and scans: `subgroupAdd`, `subgroupInclusiveAdd`, `subgroupMax`, ...
        ///
        /// Requires Capability `GroupNonUniformArithmetic`.
        const ARITHMETIC = 1 << 2;
        /// `subgroupBallot` and friends.
        const BALLOT = 1 << 3;
        /// `subgroupShuffle`, `subgroupShuffleXor`.
        const SHUFFLE = 1 << 4;
        /// `subgroupShuffleUp`, `subgroupShuffleDown`.
        ///
        /// Requires Capability `GroupNonUniformShuffleRelative`.
        const SHUFFLE_RELATIVE = 1 << 5;
        /// Clustered reductions.
        const CLUSTERED = 1 << 6;
        /// Quad broadcast and swaps.
        const QUAD = 1 << 7;
    }
}

/// Execution limits of one compute device, queried once and immutable afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCapabilities {
    /// `S`: number of lockstep invocations in a subgroup.
    pub subgroup_size: u32,
    /// `W`: largest number of invocations in one workgroup.
    pub max_workgroup_invocations: u32,
    /// Largest workgroup count along one dispatch dimension.
    pub max_workgroups_per_dimension: u32,
    pub supported_operations: SubgroupOperations,
}

impl DeviceCapabilities {
    /// Rejects numbers the hierarchy cannot be built from.
    pub fn validate(&self) -> Result<()> {
        if self.subgroup_size == 0 {
            return Err(Error::InconsistentCapabilities(
                "subgroup size is zero".into(),
            ));
        }
        if self.max_workgroup_invocations < self.subgroup_size {
            return Err(Error::InconsistentCapabilities(format!(
                "workgroup capacity {} is smaller than the subgroup size {}",
                self.max_workgroup_invocations, self.subgroup_size
            )));
        }
        if self.max_workgroups_per_dimension == 0 {
            return Err(Error::InconsistentCapabilities(
                "device cannot dispatch any workgroup".into(),
            ));
        }
        Ok(())
    }

    /// Fails fast when any operation in `required` is missing.
    pub fn require(&self, required: SubgroupOperations) -> Result<()> {
        if self.supported_operations.contains(required) {
            Ok(())
        } else {
            Err(Error::CapabilityUnsupported {
                required,
                supported: self.supported_operations,
            })
        }
    }

    /// The workgroup size used when the caller does not choose one: the
    /// largest multiple of the subgroup size not above `preferred`.
    pub fn default_workgroup_size(&self, preferred: u32) -> u32 {
        let cap = self.max_workgroup_invocations.min(preferred.max(self.subgroup_size));
        cap - cap % self.subgroup_size
    }

    /// Checks a workgroup size against these limits.
    pub fn check_workgroup_size(&self, workgroup_size: u32) -> Result<()> {
        if workgroup_size == 0 || workgroup_size > self.max_workgroup_invocations {
            return Err(Error::InvalidConfig(format!(
                "workgroup size {workgroup_size} is outside 1..={}",
                self.max_workgroup_invocations
            )));
        }
        if workgroup_size % self.subgroup_size != 0 {
            return Err(Error::InvalidConfig(format!(
                "workgroup size {workgroup_size} is not a multiple of the subgroup size {}",
                self.subgroup_size
            )));
        }
        Ok(())
    }

    /// `G`: subgroups in a workgroup of `workgroup_size` invocations.
    pub fn subgroups_per_workgroup(&self, workgroup_size: u32) -> u32 {
        workgroup_size.div_ceil(self.subgroup_size)
    }
}
