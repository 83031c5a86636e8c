#![allow(dead_code)]

use num_traits::ToPrimitive;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use subgroup_scan::{EmulatedDevice, EmulatorConfig, Engine, EngineConfig};

/// Emulated device with subgroups of `subgroup_size` and an engine running
/// workgroups of exactly `workgroup_size`.
pub fn engine(subgroup_size: u32, workgroup_size: u32) -> Engine<EmulatedDevice> {
    engine_with(
        EmulatorConfig::default()
            .subgroup_size(subgroup_size)
            .max_workgroup_invocations(workgroup_size),
        EngineConfig::default().workgroup_size(workgroup_size),
    )
}

pub fn engine_with(device: EmulatorConfig, config: EngineConfig) -> Engine<EmulatedDevice> {
    subgroup_scan::logging::init().unwrap();
    Engine::new(EmulatedDevice::new(device), config).unwrap()
}

/// Seeded uniform values in `[-1, 1)`.
pub fn noise(len: usize, seed: u64) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..len).map(|_| rng.random_range(-1.0..1.0)).collect()
}

/// Serial prefix sums in `f64`.
pub fn reference_scan<T: ToPrimitive>(values: &[T]) -> Vec<f64> {
    values
        .iter()
        .scan(0.0, |acc, v| {
            *acc += v.to_f64().unwrap();
            Some(*acc)
        })
        .collect()
}

/// Compares against an `f64` reference with an error bound growing with the
/// number of combined elements and their magnitude.
pub fn assert_close<T: ToPrimitive + Copy>(actual: &[T], expected: &[f64], magnitude: f64) {
    assert_eq!(actual.len(), expected.len());
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        let a = a.to_f64().unwrap();
        let tolerance = (i + 1) as f64 * magnitude * f64::from(f32::EPSILON) * 16.0;
        assert!(
            (a - e).abs() <= tolerance,
            "element {i}: got {a}, expected {e} (tolerance {tolerance})"
        );
    }
}
