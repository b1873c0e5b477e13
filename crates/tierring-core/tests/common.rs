//! Common builders and fixtures for integration tests.

#![allow(dead_code)]

use std::path::Path;

use tierring_core::{DeviceId, DeviceSpec, RingBuilder, RingConfig};

/// Fixed clock origin so cooldown arithmetic is reproducible.
pub const T0: u64 = 1_400_000_000;
/// One hour in seconds.
pub const HOUR: u64 = 3600;

/// A device spec on its own server.
pub fn dev(region: u32, zone: u32, weight: f64) -> DeviceSpec {
    DeviceSpec::new(
        region,
        zone,
        format!("10.{}.{}.1", region, zone),
        6000 + zone as u16,
        "sdb1",
        weight,
    )
}

/// Builder with the given devices, balanced once at `T0`.
pub fn balanced(part_power: u32, replicas: f64, min_part_hours: u32, devs: &[DeviceSpec]) -> RingBuilder {
    let mut builder = RingBuilder::new(part_power, replicas, min_part_hours).unwrap();
    for spec in devs {
        builder.add_dev(spec.clone()).unwrap();
    }
    builder.rebalance_at(Some(42), T0).unwrap();
    builder
}

/// Reader config with a hash salt and the given check interval.
pub fn salted_config(dir: &Path, reload_interval_secs: u64) -> RingConfig {
    RingConfig {
        hash_path_prefix: String::new(),
        hash_path_suffix: "integration".to_string(),
        reload_interval_secs,
        swift_dir: dir.to_path_buf(),
    }
}

/// Parts currently held by a live device.
pub fn parts_of(builder: &RingBuilder, id: DeviceId) -> u32 {
    builder.devices().get(id).map(|d| d.parts).unwrap_or(0)
}
