//! Lockstep subgroup emulation: the local combine kernel.
//!
//! All lanes of a subgroup execute every instruction together, so there is no
//! barrier anywhere in here. Every lane takes part in every operation, padding
//! lanes included, matching the uniform control flow subgroup instructions
//! require on real hardware.

use crate::element::Element;
use crate::op::CombineOp;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subgroup {
    size: usize,
}

impl Subgroup {
    /// `size` must be a power of two, as it is on every known device.
    pub fn new(size: u32) -> Self {
        debug_assert!(size.is_power_of_two(), "subgroup size {size}");
        Self {
            size: size as usize,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// `subgroupShuffleUp`: lane `i` reads lane `i - delta`. Lanes below
    /// `delta` read an undefined value; here they read their own.
    pub fn shuffle_up<T: Copy>(&self, values: &[T], delta: usize) -> Vec<T> {
        debug_assert_eq!(values.len(), self.size);
        (0..self.size)
            .map(|lane| values[lane.checked_sub(delta).unwrap_or(lane)])
            .collect()
    }

    /// `subgroupShuffleXor`: lane `i` reads lane `i ^ mask`.
    pub fn shuffle_xor<T: Copy>(&self, values: &[T], mask: usize) -> Vec<T> {
        debug_assert_eq!(values.len(), self.size);
        (0..self.size).map(|lane| values[lane ^ mask]).collect()
    }

    /// `subgroupAdd` and friends: every lane receives the combine of all lanes.
    ///
    /// Combines in butterfly order, which is not left to right; floating
    /// point totals may differ in the last bits from a serial sum.
    pub fn reduce<T: Element, O: CombineOp<T>>(&self, values: &[T]) -> T {
        debug_assert_eq!(values.len(), self.size);
        let mut lanes = values.to_vec();
        let mut mask = 1;
        while mask < self.size {
            let partner = self.shuffle_xor(&lanes, mask);
            for (lane, other) in lanes.iter_mut().zip(partner) {
                *lane = O::combine(*lane, other);
            }
            mask <<= 1;
        }
        lanes[0]
    }

    /// `subgroupInclusiveAdd` and friends, in place: lane `i` receives the
    /// combine of lanes `0..=i`.
    ///
    /// Built as a shuffle-up ladder of `log2(S)` steps, the same sequence the
    /// generated shaders use for operators lacking a native scan.
    pub fn inclusive_scan<T: Element, O: CombineOp<T>>(&self, values: &mut [T]) {
        debug_assert_eq!(values.len(), self.size);
        let mut delta = 1;
        while delta < self.size {
            let shifted = self.shuffle_up(values, delta);
            for (lane, (value, prev)) in values.iter_mut().zip(shifted).enumerate() {
                if lane >= delta {
                    *value = O::combine(prev, *value);
                }
            }
            delta <<= 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op::{Max, Sum};

    #[test]
    fn reduce_gives_every_lane_the_total() {
        let subgroup = Subgroup::new(4);
        assert_eq!(subgroup.reduce::<u32, Sum>(&[1, 2, 3, 4]), 10);
        assert_eq!(subgroup.reduce::<i32, Max>(&[-5, 9, 2, 9]), 9);
    }

    #[test]
    fn inclusive_scan_matches_serial_prefix() {
        let subgroup = Subgroup::new(8);
        let mut values = [3u32, 1, 4, 1, 5, 9, 2, 6];
        subgroup.inclusive_scan::<u32, Sum>(&mut values);
        assert_eq!(values, [3, 4, 8, 9, 14, 23, 25, 31]);
    }

    #[test]
    fn max_scan_is_running_maximum() {
        let subgroup = Subgroup::new(4);
        let mut values = [2i32, -1, 7, 3];
        subgroup.inclusive_scan::<i32, Max>(&mut values);
        assert_eq!(values, [2, 2, 7, 7]);
    }

    #[test]
    fn padding_lanes_do_not_disturb_the_total() {
        let subgroup = Subgroup::new(4);
        let mut values = [1.0f32, 2.0, 0.0, 0.0];
        subgroup.inclusive_scan::<f32, Sum>(&mut values);
        assert_eq!(values, [1.0, 3.0, 3.0, 3.0]);
    }

    #[test]
    fn single_lane_subgroup() {
        let subgroup = Subgroup::new(1);
        assert_eq!(subgroup.reduce::<u32, Sum>(&[5]), 5);
        let mut values = [5u32];
        subgroup.inclusive_scan::<u32, Sum>(&mut values);
        assert_eq!(values, [5]);
    }
}
