//! Workgroup aggregation over emulated shared memory.
//!
//! Subgroups of one workgroup run concurrently with no implied order, so
//! every hand-off through shared memory needs a barrier in between. The
//! emulated [`SharedMemory`] enforces this: it remembers which subgroup wrote
//! each slot since the last barrier and reports a [`Hazard`] when another
//! subgroup touches that slot before the next one.

use super::subgroup::Subgroup;
use crate::element::Element;
use crate::op::CombineOp;
use crate::plan::SharedLayout;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Hazard {
    #[error("subgroup {reader} read shared slot {slot} written by subgroup {writer} without a barrier")]
    ReadAfterWrite { slot: u32, writer: u32, reader: u32 },
    #[error("subgroups {first} and {second} both wrote shared slot {slot} without a barrier")]
    WriteAfterWrite { slot: u32, first: u32, second: u32 },
}

/// `var<workgroup>` storage with write tracking per barrier interval.
#[derive(Debug)]
pub struct SharedMemory<T> {
    slots: Vec<T>,
    writers: Vec<Option<u32>>,
    barriers: u32,
}

impl<T: Copy> SharedMemory<T> {
    pub fn new(capacity: u32, fill: T) -> Self {
        Self {
            slots: vec![fill; capacity as usize],
            writers: vec![None; capacity as usize],
            barriers: 0,
        }
    }

    pub fn store(&mut self, subgroup: u32, slot: u32, value: T) -> Result<(), Hazard> {
        let writer = &mut self.writers[slot as usize];
        match *writer {
            Some(first) if first != subgroup => {
                return Err(Hazard::WriteAfterWrite {
                    slot,
                    first,
                    second: subgroup,
                });
            }
            _ => *writer = Some(subgroup),
        }
        self.slots[slot as usize] = value;
        Ok(())
    }

    pub fn load(&self, subgroup: u32, slot: u32) -> Result<T, Hazard> {
        match self.writers[slot as usize] {
            Some(writer) if writer != subgroup => Err(Hazard::ReadAfterWrite {
                slot,
                writer,
                reader: subgroup,
            }),
            _ => Ok(self.slots[slot as usize]),
        }
    }

    /// `workgroupBarrier()`: execution barrier plus workgroup memory visibility.
    pub fn barrier(&mut self) {
        self.writers.fill(None);
        self.barriers += 1;
    }

    pub fn barriers(&self) -> u32 {
        self.barriers
    }
}

/// Result of aggregating one workgroup.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aggregate<T> {
    /// The workgroup total (reduce) or its carry-out (scan).
    pub value: T,
    pub barriers: u32,
}

/// Loads the `S` slots of chunk `chunk` of `level` into subgroup `chunk`,
/// padding slots past `count` with the identity.
fn load_chunk<T: Element, O: CombineOp<T>>(
    shared: &SharedMemory<T>,
    subgroup: &Subgroup,
    offset: u32,
    count: u32,
    chunk: u32,
) -> Result<Vec<T>, Hazard> {
    let size = subgroup.size() as u32;
    (0..size)
        .map(|lane| {
            let index = chunk * size + lane;
            if index < count {
                shared.load(chunk, offset + index)
            } else {
                Ok(O::identity())
            }
        })
        .collect()
}

/// Reduces the `W` values held by the invocations of one workgroup.
///
/// `lanes` already contains the identity for invocations past the end of the
/// input.
pub fn reduce<T: Element, O: CombineOp<T>>(
    subgroup: &Subgroup,
    layout: &SharedLayout,
    lanes: &[T],
) -> Result<Aggregate<T>, Hazard> {
    let size = subgroup.size() as u32;
    let totals: Vec<T> = lanes
        .chunks(subgroup.size())
        .map(|chunk| subgroup.reduce::<T, O>(chunk))
        .collect();

    let Some((top, lower)) = layout.levels.split_last() else {
        // One subgroup spans the workgroup: its total is the workgroup's.
        return Ok(Aggregate {
            value: totals[0],
            barriers: 0,
        });
    };

    let mut shared = SharedMemory::new(layout.capacity(), O::identity());
    let first = layout.levels[0];
    for (index, &total) in (0u32..).zip(&totals) {
        // Lane 0 of every subgroup.
        shared.store(index, first.offset + index, total)?;
    }
    shared.barrier();

    // More subgroups than lanes: fold S slots at a time into the next level.
    for (level, next) in lower.iter().zip(&layout.levels[1..]) {
        for chunk in 0..level.count.div_ceil(size) {
            let values = load_chunk::<T, O>(&shared, subgroup, level.offset, level.count, chunk)?;
            let total = subgroup.reduce::<T, O>(&values);
            shared.store(chunk, next.offset + chunk, total)?;
        }
        shared.barrier();
    }

    // The top level fits one subgroup.
    let values = load_chunk::<T, O>(&shared, subgroup, top.offset, top.count, 0)?;
    Ok(Aggregate {
        value: subgroup.reduce::<T, O>(&values),
        barriers: shared.barriers(),
    })
}

/// Inclusive scan, in place, of the `W` values held by one workgroup.
///
/// The returned value is the carry-out: the last invocation's result.
pub fn inclusive_scan<T: Element, O: CombineOp<T>>(
    subgroup: &Subgroup,
    layout: &SharedLayout,
    lanes: &mut [T],
) -> Result<Aggregate<T>, Hazard> {
    let size = subgroup.size() as u32;
    for chunk in lanes.chunks_mut(subgroup.size()) {
        subgroup.inclusive_scan::<T, O>(chunk);
    }

    if layout.levels.is_empty() {
        return Ok(Aggregate {
            value: lanes[lanes.len() - 1],
            barriers: 0,
        });
    }

    let mut shared = SharedMemory::new(layout.capacity(), O::identity());
    let first = layout.levels[0];
    for (index, chunk) in (0u32..).zip(lanes.chunks(subgroup.size())) {
        // The last lane of every subgroup holds the subgroup total.
        shared.store(index, first.offset + index, chunk[chunk.len() - 1])?;
    }
    shared.barrier();

    // Upward: scan every level in chunks of S, pushing chunk totals up.
    for (depth, level) in layout.levels.iter().enumerate() {
        let next = layout.levels.get(depth + 1);
        for chunk in 0..level.count.div_ceil(size) {
            let mut values =
                load_chunk::<T, O>(&shared, subgroup, level.offset, level.count, chunk)?;
            subgroup.inclusive_scan::<T, O>(&mut values);
            for (lane, &value) in (0u32..).zip(&values) {
                let index = chunk * size + lane;
                if index < level.count {
                    shared.store(chunk, level.offset + index, value)?;
                }
            }
            if let Some(next) = next {
                shared.store(chunk, next.offset + chunk, values[values.len() - 1])?;
            }
        }
        shared.barrier();
    }

    // Downward: add each chunk's carry from the level above.
    for depth in (0..layout.levels.len() - 1).rev() {
        let (level, next) = (layout.levels[depth], layout.levels[depth + 1]);
        for index in size..level.count {
            let chunk = index / size;
            let carry = shared.load(chunk, next.offset + chunk - 1)?;
            let value = shared.load(chunk, level.offset + index)?;
            shared.store(chunk, level.offset + index, O::combine(carry, value))?;
        }
        shared.barrier();
    }

    // Subgroup k adds the scanned total of subgroups 0..k.
    for (index, chunk) in (0u32..).zip(lanes.chunks_mut(subgroup.size())).skip(1) {
        let carry = shared.load(index, first.offset + index - 1)?;
        for value in chunk {
            *value = O::combine(carry, *value);
        }
    }

    Ok(Aggregate {
        value: lanes[lanes.len() - 1],
        barriers: shared.barriers(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op::{Max, Sum};

    fn serial_scan(values: &[u32]) -> Vec<u32> {
        values
            .iter()
            .scan(0u32, |acc, &v| {
                *acc += v;
                Some(*acc)
            })
            .collect()
    }

    #[test]
    fn read_before_barrier_is_a_hazard() {
        let mut shared = SharedMemory::new(4, 0u32);
        shared.store(1, 1, 7).unwrap();
        assert_eq!(shared.load(0, 1), Err(Hazard::ReadAfterWrite {
            slot: 1,
            writer: 1,
            reader: 0
        }));
        shared.barrier();
        assert_eq!(shared.load(0, 1), Ok(7));
        assert_eq!(shared.barriers(), 1);
    }

    #[test]
    fn two_writers_without_barrier_is_a_hazard() {
        let mut shared = SharedMemory::new(2, 0u32);
        shared.store(0, 0, 1).unwrap();
        assert!(matches!(
            shared.store(1, 0, 2),
            Err(Hazard::WriteAfterWrite { slot: 0, .. })
        ));
    }

    #[test]
    fn own_writes_are_visible_without_barrier() {
        let mut shared = SharedMemory::new(2, 0u32);
        shared.store(1, 0, 3).unwrap();
        assert_eq!(shared.load(1, 0), Ok(3));
    }

    #[test]
    fn reduce_with_one_barrier_when_subgroups_fit_a_subgroup() {
        let subgroup = Subgroup::new(4);
        let layout = SharedLayout::new(8, 4, 8).unwrap();
        let lanes = [1u32; 8];
        let aggregate = reduce::<u32, Sum>(&subgroup, &layout, &lanes).unwrap();
        assert_eq!(aggregate, Aggregate {
            value: 8,
            barriers: 1
        });
    }

    #[test]
    fn scan_with_two_barriers_when_subgroups_fit_a_subgroup() {
        let subgroup = Subgroup::new(4);
        let layout = SharedLayout::new(8, 4, 8).unwrap();
        let mut lanes = [1u32; 8];
        let aggregate = inclusive_scan::<u32, Sum>(&subgroup, &layout, &mut lanes).unwrap();
        assert_eq!(lanes, [1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(aggregate, Aggregate {
            value: 8,
            barriers: 2
        });
    }

    #[test]
    fn deep_shared_hierarchy_when_subgroups_outnumber_lanes() {
        // W = 128, S = 4: G = 32 subgroups, shared levels 32 -> 8 -> 2.
        let subgroup = Subgroup::new(4);
        let layout = SharedLayout::new(128, 4, 8).unwrap();
        assert_eq!(layout.levels.len(), 3);

        let input: Vec<u32> = (0..128).map(|i| i % 7 + 1).collect();

        let total = reduce::<u32, Sum>(&subgroup, &layout, &input).unwrap();
        assert_eq!(total.value, input.iter().sum::<u32>());
        assert_eq!(total.barriers, 3);

        let mut lanes = input.clone();
        let carry = inclusive_scan::<u32, Sum>(&subgroup, &layout, &mut lanes).unwrap();
        assert_eq!(lanes, serial_scan(&input));
        assert_eq!(carry.value, input.iter().sum::<u32>());
        assert_eq!(carry.barriers, 6);
    }

    #[test]
    fn single_subgroup_workgroup_needs_no_barrier() {
        let subgroup = Subgroup::new(8);
        let layout = SharedLayout::new(8, 8, 8).unwrap();
        let mut lanes = [2u32; 8];
        let carry = inclusive_scan::<u32, Sum>(&subgroup, &layout, &mut lanes).unwrap();
        assert_eq!(carry.barriers, 0);
        assert_eq!(carry.value, 16);
    }

    #[test]
    fn max_aggregation() {
        let subgroup = Subgroup::new(4);
        let layout = SharedLayout::new(16, 4, 8).unwrap();
        let mut lanes = [3i32, -1, 4, 1, -5, 9, 2, -6, 5, 3, 5, 8, -9, 7, 9, 3];
        let total = reduce::<i32, Max>(&subgroup, &layout, &lanes).unwrap();
        assert_eq!(total.value, 9);
        inclusive_scan::<i32, Max>(&subgroup, &layout, &mut lanes).unwrap();
        assert_eq!(lanes, [3, 3, 4, 4, 4, 9, 9, 9, 9, 9, 9, 9, 9, 9, 9, 9]);
    }
}
