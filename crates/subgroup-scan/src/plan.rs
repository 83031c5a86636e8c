//! Sizing of the dispatch hierarchy and of the shared-memory partials.
//!
//! Every level size follows from `N`, `S` and `W`, so both are computed up
//! front as explicit lists instead of recursing while dispatching.

use crate::error::{Error, Result};

/// One level of the dispatch hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelPlan {
    /// Valid elements at this level.
    pub len: u32,
    /// Workgroups dispatched over this level, `ceil(len / W)`. This is also
    /// the length of the next level.
    pub workgroups: u32,
}

/// The levels `N → ceil(N/W) → … → 1` of a multi-pass reduce or scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HierarchyPlan {
    pub workgroup_size: u32,
    pub levels: Vec<LevelPlan>,
}

impl HierarchyPlan {
    /// Plans `len > 0` elements over workgroups of `workgroup_size`.
    pub fn new(len: usize, workgroup_size: u32, max_depth: u32) -> Result<Self> {
        let len = u32::try_from(len).map_err(|_overflow| Error::InputTooLarge { len })?;
        if len == 0 {
            return Err(Error::InvalidConfig(
                "cannot plan a hierarchy over zero elements".into(),
            ));
        }
        if workgroup_size == 0 {
            return Err(Error::InvalidConfig("workgroup size is zero".into()));
        }

        let mut levels = Vec::new();
        let mut level_len = len;
        loop {
            let workgroups = level_len.div_ceil(workgroup_size);
            levels.push(LevelPlan {
                len: level_len,
                workgroups,
            });
            if levels.len() > max_depth as usize {
                return Err(Error::HierarchyDepthExceeded {
                    depth: levels.len(),
                    max_depth,
                });
            }
            if workgroups == 1 {
                break;
            }
            // A level that does not shrink would never reach a single group.
            if workgroups >= level_len {
                return Err(Error::HierarchyDepthExceeded {
                    depth: levels.len() + 1,
                    max_depth,
                });
            }
            level_len = workgroups;
        }

        Ok(Self {
            workgroup_size,
            levels,
        })
    }

    pub fn depth(&self) -> usize {
        self.levels.len()
    }

    pub fn top(&self) -> LevelPlan {
        // `new` always pushes at least one level.
        self.levels[self.levels.len() - 1]
    }
}

/// One level of shared partials inside a workgroup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SharedLevel {
    pub offset: u32,
    pub count: u32,
}

/// Layout of the shared partial storage of one workgroup.
///
/// Level 0 holds one slot per subgroup (`G = W / S`). While a level has more
/// than `S` slots it cannot be combined by a single subgroup, so another level
/// of `ceil(count / S)` slots is stacked on top until one subgroup suffices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedLayout {
    pub subgroup_size: u32,
    pub levels: Vec<SharedLevel>,
}

impl SharedLayout {
    pub fn new(workgroup_size: u32, subgroup_size: u32, max_depth: u32) -> Result<Self> {
        if subgroup_size == 0 || workgroup_size % subgroup_size != 0 {
            return Err(Error::InconsistentCapabilities(format!(
                "workgroup size {workgroup_size} is not a multiple of subgroup size {subgroup_size}"
            )));
        }

        let mut levels = Vec::new();
        let mut count = workgroup_size / subgroup_size;
        let mut offset = 0;
        if count > 1 {
            loop {
                levels.push(SharedLevel { offset, count });
                if levels.len() > max_depth as usize {
                    return Err(Error::HierarchyDepthExceeded {
                        depth: levels.len(),
                        max_depth,
                    });
                }
                if count <= subgroup_size {
                    break;
                }
                let next = count.div_ceil(subgroup_size);
                if next >= count {
                    return Err(Error::HierarchyDepthExceeded {
                        depth: levels.len() + 1,
                        max_depth,
                    });
                }
                offset += count;
                count = next;
            }
        }

        Ok(Self {
            subgroup_size,
            levels,
        })
    }

    /// Number of shared slots the workgroup needs, at least one.
    pub fn capacity(&self) -> u32 {
        self.levels
            .last()
            .map_or(1, |level| level.offset + level.count)
    }

    /// Barriers a reduce issues per workgroup.
    pub fn reduce_barriers(&self) -> u32 {
        self.levels.len() as u32
    }

    /// Barriers a scan issues per workgroup: one after the subgroup totals
    /// land, then one per upward level and one per downward level.
    pub fn scan_barriers(&self) -> u32 {
        match self.levels.len() {
            0 => 0,
            depth => 2 * depth as u32,
        }
    }
}
