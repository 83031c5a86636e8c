//! Runs the engine on the first real adapter with subgroup support.
//!
//! Ignored by default; run with `cargo test -- --ignored` on a machine with
//! such an adapter. Without one they fail.
#![cfg(feature = "wgpu")]

mod common;

use common::{assert_close, noise, reference_scan};
use subgroup_scan::{Engine, EngineConfig, Max, Min, Sum, WgpuDevice, sequential};

fn gpu_engine() -> Engine<WgpuDevice> {
    subgroup_scan::logging::init().unwrap();
    let device = WgpuDevice::new().unwrap_or_else(|err| panic!("no usable adapter: {err}"));
    Engine::new(device, EngineConfig::default()).unwrap()
}

const LENGTHS: [usize; 7] = [1, 31, 32, 257, 4096, 65_537, 1 << 20];

#[test]
#[ignore = "needs a GPU adapter with subgroup support"]
fn integer_sums_match_the_host() {
    let engine = gpu_engine();
    for len in LENGTHS {
        let values: Vec<u32> = (0..len as u32).map(|i| i.wrapping_mul(2_654_435_761) >> 20).collect();
        assert_eq!(
            engine.sum(&values).unwrap(),
            sequential::reduce::<u32, Sum>(&values),
            "sum of {len}"
        );
        assert_eq!(
            engine.prefix_sum(&values).unwrap(),
            sequential::scan_inclusive::<u32, Sum>(&values),
            "scan of {len}"
        );
    }
}

#[test]
#[ignore = "needs a GPU adapter with subgroup support"]
fn float_prefix_sums_within_tolerance() {
    let engine = gpu_engine();
    for len in LENGTHS {
        let values = noise(len, 11);
        assert_close(&engine.prefix_sum(&values).unwrap(), &reference_scan(&values), 1.0);
    }
}

#[test]
#[ignore = "needs a GPU adapter with subgroup support"]
fn max_and_min_scans() {
    let engine = gpu_engine();
    for len in LENGTHS {
        let values: Vec<i32> = (0..len as i64).map(|i| (i * 7919 % 10_007) as i32 - 5000).collect();
        assert_eq!(
            engine.scan::<i32, Max>(&values).unwrap(),
            sequential::scan_inclusive::<i32, Max>(&values),
            "max scan of {len}"
        );
        assert_eq!(
            engine.reduce::<i32, Min>(&values).unwrap(),
            sequential::reduce::<i32, Min>(&values),
            "min of {len}"
        );
        assert_eq!(
            engine.scan_exclusive::<i32, Min>(&values).unwrap(),
            sequential::scan_exclusive::<i32, Min>(&values),
            "exclusive min scan of {len}"
        );
    }
}
