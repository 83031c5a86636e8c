use bytemuck::Pod;
use core::fmt;
use num_traits::ToPrimitive;

/// A 32-bit scalar the engine can reduce and scan.
///
/// Device buffers are arrays of 32-bit words, elements are reinterpreted in
/// place with [`bytemuck`].
pub trait Element: Pod + PartialEq + PartialOrd + ToPrimitive + Send + Sync + fmt::Debug {
    /// Name of the type in WGSL.
    const WGSL_TYPE: &'static str;
    const ZERO: Self;
    /// Smallest value, the identity of `max`.
    const LOWEST: Self;
    /// Largest value, the identity of `min`.
    const HIGHEST: Self;

    /// Addition as the device performs it (wrapping for integers).
    fn add(self, rhs: Self) -> Self;

    fn maximum(self, rhs: Self) -> Self {
        if rhs > self { rhs } else { self }
    }

    fn minimum(self, rhs: Self) -> Self {
        if rhs < self { rhs } else { self }
    }

    fn to_bits(self) -> u32 {
        bytemuck::cast(self)
    }

    fn from_bits(bits: u32) -> Self {
        bytemuck::cast(bits)
    }

    /// An exact WGSL expression for `self`.
    ///
    /// Goes through the bit pattern so `-inf`, `i32::MIN` and friends survive
    /// the trip into shader source.
    fn wgsl_literal(self) -> String {
        format!("bitcast<{}>({:#010x}u)", Self::WGSL_TYPE, self.to_bits())
    }
}

impl Element for f32 {
    const WGSL_TYPE: &'static str = "f32";
    const ZERO: Self = 0.0;
    const LOWEST: Self = f32::NEG_INFINITY;
    const HIGHEST: Self = f32::INFINITY;

    fn add(self, rhs: Self) -> Self {
        self + rhs
    }
}

impl Element for u32 {
    const WGSL_TYPE: &'static str = "u32";
    const ZERO: Self = 0;
    const LOWEST: Self = u32::MIN;
    const HIGHEST: Self = u32::MAX;

    fn add(self, rhs: Self) -> Self {
        self.wrapping_add(rhs)
    }
}

impl Element for i32 {
    const WGSL_TYPE: &'static str = "i32";
    const ZERO: Self = 0;
    const LOWEST: Self = i32::MIN;
    const HIGHEST: Self = i32::MAX;

    fn add(self, rhs: Self) -> Self {
        self.wrapping_add(rhs)
    }
}

/// Reinterprets host elements as device words.
pub fn to_words<T: Element>(values: &[T]) -> &[u32] {
    bytemuck::cast_slice(values)
}

/// Reinterprets device words as host elements.
pub fn from_words<T: Element>(words: Vec<u32>) -> Vec<T> {
    words.into_iter().map(T::from_bits).collect()
}
