//! CPU execution of the three kernels.
//!
//! Workgroups of a dispatch run in parallel on the rayon pool. Each one owns a
//! disjoint chunk of every buffer it writes, which is exactly the isolation a
//! real dispatch gives: no workgroup observes another one.

use super::subgroup::Subgroup;
use super::workgroup::{self, Hazard};
use super::DispatchParams;
use crate::element::Element;
use crate::op::CombineOp;
use crate::plan::SharedLayout;
use rayon::prelude::*;

/// What every workgroup of a dispatch is built from.
#[derive(Debug, Clone)]
pub struct WorkgroupShape {
    pub workgroup_size: u32,
    pub subgroup: Subgroup,
    pub layout: SharedLayout,
}

impl WorkgroupShape {
    fn size(&self) -> usize {
        self.workgroup_size as usize
    }

    /// The `W` lanes of workgroup `group`, identity past the end of the level.
    fn load_lanes<T: Element, O: CombineOp<T>>(&self, input: &[u32], group: usize) -> Vec<T> {
        let start = group * self.size();
        (start..start + self.size())
            .map(|index| input.get(index).map_or_else(O::identity, |&w| T::from_bits(w)))
            .collect()
    }
}

/// Writes one combined value per workgroup into `partials`.
///
/// Returns the barriers each workgroup issued.
pub fn reduce<T: Element, O: CombineOp<T>>(
    shape: &WorkgroupShape,
    params: DispatchParams,
    input: &[u32],
    partials: &mut [u32],
) -> Result<u32, Hazard> {
    let input = &input[..params.len as usize];
    partials[..params.workgroup_count as usize]
        .par_iter_mut()
        .enumerate()
        .map(|(group, partial)| {
            let lanes = shape.load_lanes::<T, O>(input, group);
            let total = workgroup::reduce::<T, O>(&shape.subgroup, &shape.layout, &lanes)?;
            // Invocation 0 writes the workgroup's slot.
            *partial = total.value.to_bits();
            Ok(total.barriers)
        })
        .try_reduce(|| 0, |a, b| Ok(a.max(b)))
}

/// Scans every workgroup of `input` into `output` and writes each
/// workgroup's carry-out into `partials`.
pub fn scan_local<T: Element, O: CombineOp<T>>(
    shape: &WorkgroupShape,
    params: DispatchParams,
    input: &[u32],
    output: &mut [u32],
    partials: &mut [u32],
) -> Result<u32, Hazard> {
    let input = &input[..params.len as usize];
    output[..params.len as usize]
        .par_chunks_mut(shape.size())
        .zip(partials[..params.workgroup_count as usize].par_iter_mut())
        .enumerate()
        .map(|(group, (chunk, partial))| {
            let mut lanes = shape.load_lanes::<T, O>(input, group);
            let carry =
                workgroup::inclusive_scan::<T, O>(&shape.subgroup, &shape.layout, &mut lanes)?;
            // Padding lanes computed values too; only valid ones are stored.
            for (word, value) in chunk.iter_mut().zip(&lanes) {
                *word = value.to_bits();
            }
            *partial = carry.value.to_bits();
            Ok(carry.barriers)
        })
        .try_reduce(|| 0, |a, b| Ok(a.max(b)))
}

/// Combines `carries[k - 1]` into every valid element of workgroup `k > 0`,
/// in place. Workgroup 0 has nothing before it and returns at once.
pub fn propagate<T: Element, O: CombineOp<T>>(
    shape: &WorkgroupShape,
    params: DispatchParams,
    data: &mut [u32],
    carries: &[u32],
) {
    data[..params.len as usize]
        .par_chunks_mut(shape.size())
        .enumerate()
        .skip(1)
        .for_each(|(group, chunk)| {
            let carry = T::from_bits(carries[group - 1]);
            for word in chunk {
                *word = O::combine(carry, T::from_bits(*word)).to_bits();
            }
        });
}
